//! Every record as one JSON line in a single stream, unfiltered.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::errors::ArchiveError;
use crate::metrics::RECORDS_APPENDED;
use crate::model::FeedRecord;
use crate::sink::{RecordSink, SinkSummary};

pub struct JsonLinesSink<W: AsyncWrite + Unpin + Send> {
    name: String,
    out: BufWriter<W>,
    written: usize,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    /// `name` only labels I/O errors.
    pub fn new(name: impl Into<String>, out: W) -> Self {
        JsonLinesSink {
            name: name.into(),
            out: BufWriter::new(out),
            written: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RecordSink for JsonLinesSink<W> {
    async fn consume(&mut self, record: &FeedRecord) -> Result<(), ArchiveError> {
        let line = record.to_json_line()?;
        self.out
            .write_all(&line)
            .await
            .map_err(|e| ArchiveError::Io(self.name.clone(), e))?;
        self.written += 1;
        RECORDS_APPENDED.inc();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ArchiveError> {
        self.out
            .flush()
            .await
            .map_err(|e| ArchiveError::Io(self.name.clone(), e))
    }

    fn summary(&self) -> SinkSummary {
        SinkSummary {
            appended: self.written,
            ..SinkSummary::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writes_every_record_in_order() {
        let mut sink = JsonLinesSink::new("memory", Vec::new());
        for cid in ["b", "a"] {
            let record = FeedRecord::from_value(json!({"post": {"cid": cid}})).unwrap();
            sink.consume(&record).await.unwrap();
        }
        sink.close().await.unwrap();
        assert_eq!(sink.summary().appended, 2);

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, "{\"post\":{\"cid\":\"b\"}}\n{\"post\":{\"cid\":\"a\"}}\n");
    }
}
