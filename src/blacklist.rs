use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

/// Key prefix for revoked token IDs in Redis.
const KEY_PREFIX: &str = "pricewatch:blacklist:";

/// Redis-backed token blacklist.
///
/// The auth service writes revoked `jti` values with a TTL matching the
/// token lifetime; this side only reads. A cache outage fails open so that a
/// Redis restart does not take the API down with it.
pub struct TokenBlacklist {
    conn: ConnectionManager,
}

impl TokenBlacklist {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub async fn is_revoked(&self, jti: &str) -> bool {
        let mut conn = self.conn.clone();
        let key = format!("{KEY_PREFIX}{jti}");
        match conn.exists::<_, bool>(&key).await {
            Ok(revoked) => revoked,
            Err(e) => {
                warn!("blacklist lookup failed, allowing token: {e}");
                false
            }
        }
    }
}
