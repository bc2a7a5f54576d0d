use log::warn;

/// Payload shape, dispatched on the key's extension with `.gz` stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// Measurement tuples, one per line.
    Csv,
    /// One JSON document per line, measures only.
    NdJson,
    /// A single document with optional meta/locations/measures sections.
    Json,
}

impl PayloadFormat {
    pub fn from_key(key: &str) -> Option<PayloadFormat> {
        let base = key.strip_suffix(".gz").unwrap_or(key);
        if base.ends_with(".csv") {
            Some(PayloadFormat::Csv)
        } else if base.ends_with(".ndjson") {
            Some(PayloadFormat::NdJson)
        } else if base.ends_with(".json") {
            Some(PayloadFormat::Json)
        } else {
            None
        }
    }
}

/// Parse a single CSV line into its fields. Quoting is respected, so an
/// ingest id containing a comma survives.
pub fn csv_record(line: &str) -> Option<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    match reader.records().next()? {
        Ok(record) => Some(record.iter().map(str::to_string).collect()),
        Err(err) => {
            warn!("dropping unparseable csv record: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_on_extension_with_gz_stripped() {
        assert_eq!(PayloadFormat::from_key("measures/a.csv"), Some(PayloadFormat::Csv));
        assert_eq!(PayloadFormat::from_key("measures/a.csv.gz"), Some(PayloadFormat::Csv));
        assert_eq!(
            PayloadFormat::from_key("realtime/2024-01-01.ndjson.gz"),
            Some(PayloadFormat::NdJson)
        );
        assert_eq!(PayloadFormat::from_key("stations/site.json"), Some(PayloadFormat::Json));
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        assert_eq!(PayloadFormat::from_key("x.tab"), None);
        assert_eq!(PayloadFormat::from_key("x.csv.zip"), None);
        assert_eq!(PayloadFormat::from_key("no-extension"), None);
    }

    #[test]
    fn csv_records_respect_quoting() {
        assert_eq!(
            csv_record("\"source-loc,1-pm25\",3.5,1618958580").unwrap(),
            vec!["source-loc,1-pm25", "3.5", "1618958580"]
        );
    }
}
