//! Flux query construction and annotated-CSV decoding.

use bytes::Bytes;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use csv_async::{AsyncReaderBuilder, StringRecord};
use futures::{Stream, StreamExt, TryStreamExt};
use std::io;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::io::StreamReader;

use crate::error::StoreError;
use crate::models::{Sample, Window};
use crate::store::SampleStream;

/// Quote a Flux string literal
pub fn flux_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '$' => quoted.push_str("\\$"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

pub(crate) fn rfc3339(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Range query for one measurement/field over a closed window.
///
/// Flux `range` excludes `stop`, so the stop bound is pushed one nanosecond
/// past the window end. Tables are merged and sorted by time so the result
/// arrives as a single ordered sequence.
pub fn window_query(bucket: &str, measurement: &str, field: &str, window: &Window) -> String {
    let stop = window.end() + Duration::nanoseconds(1);
    format!(
        r#"from(bucket: {bucket})
  |> range(start: {start}, stop: {stop})
  |> filter(fn: (r) => r["_measurement"] == {measurement})
  |> filter(fn: (r) => r["_field"] == {field})
  |> group()
  |> keep(columns: ["_time", "_value"])
  |> sort(columns: ["_time"])"#,
        bucket = flux_string(bucket),
        start = rfc3339(window.start()),
        stop = rfc3339(stop),
        measurement = flux_string(measurement),
        field = flux_string(field),
    )
}

#[derive(Debug, Clone, Copy)]
enum TableHeader {
    Data { time: usize, value: usize },
    Error { error: usize },
}

/// Record-level decoder for Flux annotated CSV.
///
/// Every table starts with `#` annotation rows followed by a header row.
/// Blank records, where the CSV reader reports them, also end a table.
#[derive(Debug, Default)]
pub struct AnnotatedCsvDecoder {
    header: Option<TableHeader>,
}

impl AnnotatedCsvDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one record. Header, annotation and blank records yield `None`.
    pub fn decode_record(&mut self, record: &StringRecord) -> Result<Option<Sample>, StoreError> {
        let first = record.get(0).unwrap_or_default();
        if first.starts_with('#') || record.iter().all(str::is_empty) {
            self.header = None;
            return Ok(None);
        }

        let header = match self.header {
            Some(header) => header,
            None => {
                self.header = Some(Self::parse_header(record)?);
                return Ok(None);
            }
        };

        match header {
            TableHeader::Error { error } => {
                let message = record.get(error).unwrap_or_default().to_string();
                Err(StoreError::Reported(message))
            }
            TableHeader::Data { time, value } => {
                let missing = |column: &str| {
                    let row = record.iter().collect::<Vec<_>>().join(",");
                    StoreError::Protocol(format!("row has no {column} cell: {row}"))
                };
                let time_cell = record.get(time).ok_or_else(|| missing("_time"))?;
                let value_cell = record.get(value).ok_or_else(|| missing("_value"))?;

                let timestamp = DateTime::parse_from_rfc3339(time_cell)
                    .map_err(|e| StoreError::Protocol(format!("invalid _time {time_cell:?}: {e}")))?
                    .with_timezone(&Utc);
                let value = value_cell.parse::<f64>().map_err(|e| {
                    StoreError::Protocol(format!("invalid _value {value_cell:?}: {e}"))
                })?;

                Ok(Some(Sample::new(timestamp, value)))
            }
        }
    }

    fn parse_header(record: &StringRecord) -> Result<TableHeader, StoreError> {
        let position = |name: &str| record.iter().position(|c| c == name);
        match (position("_time"), position("_value"), position("error")) {
            (Some(time), Some(value), _) => Ok(TableHeader::Data { time, value }),
            (_, _, Some(error)) => Ok(TableHeader::Error { error }),
            _ => Err(StoreError::Protocol(format!(
                "table header lacks _time/_value columns: {}",
                record.iter().collect::<Vec<_>>().join(",")
            ))),
        }
    }
}

/// Decode a chunked response body into samples as the chunks arrive
pub fn decode_stream<S, E>(body: S) -> SampleStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<StoreError> + Send + 'static,
{
    // Body errors travel through the reader as io::Error and are unwrapped again below.
    let chunks = body
        .map_err(|e| io::Error::other(Into::<StoreError>::into(e)))
        .boxed();
    let reader = StreamReader::new(chunks).compat();

    let stream = async_stream::try_stream! {
        let mut decoder = AnnotatedCsvDecoder::new();
        let records = AsyncReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .create_reader(reader)
            .into_records();
        futures::pin_mut!(records);

        while let Some(record) = records.next().await {
            let record = record.map_err(csv_error)?;
            if let Some(sample) = decoder.decode_record(&record)? {
                yield sample;
            }
        }
    };
    stream.boxed()
}

fn csv_error(err: csv_async::Error) -> StoreError {
    let message = err.to_string();
    match err.into_kind() {
        csv_async::ErrorKind::Io(io_err) => {
            match io_err.into_inner().map(|inner| inner.downcast::<StoreError>()) {
                Some(Ok(store_err)) => *store_err,
                _ => StoreError::Connection(message),
            }
        }
        _ => StoreError::Protocol(format!("malformed annotated CSV: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TWO_TABLES: &str = "#datatype,string,long,dateTime:RFC3339,double\r\n\
#group,false,false,false,false\r\n\
#default,_result,,,\r\n\
,result,table,_time,_value\r\n\
,,0,2024-01-01T00:00:10Z,1.5\r\n\
,,0,2024-01-01T00:00:20.5Z,2\r\n\
\r\n\
#datatype,string,long,double,dateTime:RFC3339\r\n\
#group,false,false,false,false\r\n\
#default,_result,,,\r\n\
,result,table,_value,_time\r\n\
,,1,3.25,2024-01-01T00:00:30Z\r\n\
\r\n";

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn test_window_query() {
        let window = Window::new(at(1_704_067_200), at(1_704_070_800)).expect("valid window");
        let query = window_query("test", "Vehicle speed", "value", &window);
        assert!(query.contains(r#"from(bucket: "test")"#));
        assert!(query.contains(
            "range(start: 2024-01-01T00:00:00Z, stop: 2024-01-01T01:00:00.000000001Z)"
        ));
        assert!(query.contains(r#"r["_measurement"] == "Vehicle speed""#));
        assert!(query.contains(r#"r["_field"] == "value""#));
    }

    #[test]
    fn test_flux_string_escapes() {
        assert_eq!(flux_string(r#"a"b\c"#), r#""a\"b\\c""#);
        assert_eq!(flux_string("${x}"), r#""\${x}""#);
    }

    /// Decode `text` delivered in `chunk`-byte pieces, keeping every item
    async fn decode(text: &str, chunk: usize) -> Vec<Result<Sample, StoreError>> {
        let chunks: Vec<Result<Bytes, StoreError>> = text
            .as_bytes()
            .chunks(chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        decode_stream(futures::stream::iter(chunks)).collect().await
    }

    #[tokio::test]
    async fn test_decodes_tables_with_different_column_order() {
        let samples: Vec<Sample> = decode(TWO_TABLES, TWO_TABLES.len())
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("valid tables");

        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], Sample::new(at(1_704_067_210), 1.5));
        assert_eq!(
            samples[1].timestamp,
            at(1_704_067_220) + Duration::milliseconds(500)
        );
        assert_eq!(samples[1].value, 2.0);
        assert_eq!(samples[2], Sample::new(at(1_704_067_230), 3.25));
    }

    #[tokio::test]
    async fn test_error_table() {
        let csv = "#datatype,string,string\r\n\
#group,true,true\r\n\
#default,,\r\n\
,error,reference\r\n\
,\"bucket \"\"nope\"\" not found\",\r\n\
\r\n";
        let items = decode(csv, csv.len()).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            &items[0],
            Err(StoreError::Reported(m)) if m == r#"bucket "nope" not found"#
        ));
    }

    #[tokio::test]
    async fn test_error_message_with_embedded_newline() {
        let csv = "#datatype,string,string\r\n\
#group,true,true\r\n\
#default,,\r\n\
,error,reference\r\n\
,\"line one\nline two, with comma\",897\r\n\
\r\n";
        let items = decode(csv, 5).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            &items[0],
            Err(StoreError::Reported(m)) if m == "line one\nline two, with comma"
        ));
    }

    #[tokio::test]
    async fn test_rejects_bad_value() {
        let csv = ",result,table,_time,_value\r\n,,0,2024-01-01T00:00:10Z,fast\r\n";
        let items = decode(csv, csv.len()).await;
        assert!(matches!(items.as_slice(), [Err(StoreError::Protocol(_))]));
    }

    #[tokio::test]
    async fn test_body_error_keeps_its_kind() {
        let chunks: Vec<Result<Bytes, StoreError>> = vec![
            Ok(Bytes::from_static(b",result,table,_time,_value\r\n")),
            Err(StoreError::Connection("connection reset".to_string())),
        ];
        let items: Vec<_> = decode_stream(futures::stream::iter(chunks)).collect().await;
        assert!(matches!(
            items.last(),
            Some(Err(StoreError::Connection(m))) if m == "connection reset"
        ));
    }

    #[tokio::test]
    async fn test_decode_stream_across_chunk_boundaries() {
        let bytes = TWO_TABLES.as_bytes();
        let chunks: Vec<Result<Bytes, StoreError>> = bytes
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let samples: Vec<Sample> = decode_stream(futures::stream::iter(chunks))
            .try_collect()
            .await
            .expect("decoded");
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[2].value, 3.25);
    }

    #[tokio::test]
    async fn test_decode_stream_empty_body() {
        let chunks: Vec<Result<Bytes, StoreError>> = vec![Ok(Bytes::from_static(b"\r\n"))];
        let samples: Vec<Sample> = decode_stream(futures::stream::iter(chunks))
            .try_collect()
            .await
            .expect("decoded");
        assert!(samples.is_empty());
    }
}
