//! JSON-lines codec.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::trace;

use crate::error::ProtoError;
use crate::message::Message;

/// Serialize a message to a single line (without the trailing newline).
pub fn encode(message: &Message) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(message)?)
}

/// Parse one line into a message.
pub fn decode(line: &str) -> Result<Message, ProtoError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Reads messages from a line-oriented byte stream.
pub struct MessageReader<R> {
    lines: LinesStream<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: LinesStream::new(BufReader::new(reader).lines()),
        }
    }

    /// Next message, `Ok(None)` at end of stream.
    ///
    /// Blank lines are skipped. A malformed line yields an error but leaves
    /// the reader usable for the lines after it.
    pub async fn next_message(&mut self) -> Result<Option<Message>, ProtoError> {
        while let Some(line) = self.lines.next().await {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            trace!(len = line.len(), "Received protocol line");
            return decode(&line).map(Some);
        }
        Ok(None)
    }
}

/// Writes messages as JSON lines.
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), ProtoError> {
        let json = encode(message)?;
        trace!(kind = message.kind(), len = json.len(), "Sending protocol line");
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ControlCommand, Payload};
    use agentpool_core::{Task, TaskId};

    #[test]
    fn test_decode_hand_written_line() {
        let line = r#"{"id":"m1","timestamp":"2026-01-01T00:00:00Z","payload":{"kind":"ready","data":{"pid":4242}}}"#;
        let msg = decode(line).unwrap();
        assert_eq!(msg.kind(), "ready");
        assert!(matches!(msg.payload, Payload::Ready(r) if r.pid == 4242));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let line = r#"{"id":"m1","timestamp":"2026-01-01T00:00:00Z","payload":{"kind":"gossip","data":{}}}"#;
        assert!(matches!(decode(line), Err(ProtoError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_reader_writer_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = MessageWriter::new(client);
        let mut reader = MessageReader::new(server);

        writer
            .send(&Message::task(Task::shell("echo hi").with_id("t1")))
            .await
            .unwrap();
        writer
            .send(&Message::control(ControlCommand::Shutdown))
            .await
            .unwrap();
        drop(writer);

        let first = reader.next_message().await.unwrap().unwrap();
        match first.payload {
            Payload::Task(task) => assert_eq!(task.id, TaskId::new("t1")),
            other => panic!("unexpected payload: {:?}", other),
        }
        let second = reader.next_message().await.unwrap().unwrap();
        assert_eq!(second.payload, Payload::Control(ControlCommand::Shutdown));
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_skips_blank_and_survives_garbage() {
        let input = b"\n\nnot json\n{\"id\":\"m2\",\"timestamp\":\"2026-01-01T00:00:00Z\",\"payload\":{\"kind\":\"ready\",\"data\":{\"pid\":1}}}\n";
        let mut reader = MessageReader::new(&input[..]);

        assert!(reader.next_message().await.is_err());
        let msg = reader.next_message().await.unwrap().unwrap();
        assert_eq!(msg.kind(), "ready");
        assert!(reader.next_message().await.unwrap().is_none());
    }
}
