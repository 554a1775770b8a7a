use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PubSubError;

/// A single message on the bus: `<topic-bytes><payload-envelope-bytes>`
/// per `spec.md` §4.4. Over a byte stream the two parts need a delimiter;
/// this crate prefixes each with its length (`u32`, big-endian) rather than
/// relying on topic strings never containing the raw envelope's leading
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: String,
    pub envelope: Vec<u8>,
}

impl Frame {
    pub fn new(topic: impl Into<String>, envelope: Vec<u8>) -> Self {
        Self { topic: topic.into(), envelope }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), PubSubError> {
        let topic_bytes = self.topic.as_bytes();
        writer.write_u32(topic_bytes.len() as u32).await?;
        writer.write_all(topic_bytes).await?;
        writer.write_u32(self.envelope.len() as u32).await?;
        writer.write_all(&self.envelope).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, PubSubError> {
        let topic_len = reader.read_u32().await? as usize;
        let mut topic_bytes = vec![0u8; topic_len];
        reader.read_exact(&mut topic_bytes).await?;
        let topic = String::from_utf8_lossy(&topic_bytes).into_owned();

        let envelope_len = reader.read_u32().await? as usize;
        let mut envelope = vec![0u8; envelope_len];
        reader.read_exact(&mut envelope).await?;

        Ok(Frame { topic, envelope })
    }

    /// Whether `filter` is a topic-prefix match for this frame, the
    /// broker's subscriber-selection rule from `spec.md` §4.4.
    pub fn matches(&self, filter: &str) -> bool {
        self.topic.starts_with(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_an_in_memory_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = Frame::new("tcf.cluster.leader", b"hello".to_vec());
        frame.write_to(&mut client).await.unwrap();
        let received = Frame::read_from(&mut server).await.unwrap();
        assert_eq!(received, frame);
    }

    #[test]
    fn prefix_matching() {
        let frame = Frame::new("tcf.cluster.distributed_store.leader", Vec::new());
        assert!(frame.matches("tcf.cluster"));
        assert!(!frame.matches("tcf.other"));
    }
}
