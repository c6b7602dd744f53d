use csv::{Terminator, WriterBuilder};

/// Serialize an extraction or comparison as RFC 4180 CSV: comma delimiter,
/// CRLF line endings, header row first, quoting only where required.
pub fn write_csv(columns: &[String], rows: &[Vec<String>]) -> String {
    let mut writer = WriterBuilder::new()
        .terminator(Terminator::CRLF)
        .from_writer(Vec::new());

    // Writes to an in-memory buffer cannot fail.
    let _ = writer.write_record(columns);
    for row in rows {
        let _ = writer.write_record(row);
    }

    let bytes = writer.into_inner().unwrap_or_default();
    String::from_utf8(bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_crlf_and_header() {
        let csv = write_csv(
            &strings(&["reference", "value"]),
            &[strings(&["LC1D09", "120"])],
        );
        assert_eq!(csv, "reference,value\r\nLC1D09,120\r\n");
    }

    #[test]
    fn test_quoting_with_doubling() {
        let csv = write_csv(
            &strings(&["reference", "desc"]),
            &[strings(&["A,1", "said \"hi\"\nbye"])],
        );
        assert_eq!(csv, "reference,desc\r\n\"A,1\",\"said \"\"hi\"\"\nbye\"\r\n");
    }

    #[test]
    fn test_round_trip() {
        let columns = strings(&["reference", "variant", "value"]);
        let rows = vec![
            strings(&["LC1D09", "AC-1", "1,200"]),
            strings(&["LC1D09", "AC-3", "1,350"]),
            strings(&["LC1D12", "", "quoted \"x\""]),
        ];
        let csv = write_csv(&columns, &rows);

        let mut reader = csv::ReaderBuilder::new().from_reader(csv.as_bytes());
        let parsed_header: Vec<String> = reader
            .headers()
            .unwrap()
            .iter()
            .map(String::from)
            .collect();
        assert_eq!(parsed_header, columns);

        let parsed_rows: Vec<Vec<String>> = reader
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect();
        assert_eq!(parsed_rows, rows);
    }
}
