//! Composable I/O layers around a session's two halves.
//!
//! Layers are pushed innermost first and always sit below a buffering layer.
//! Closing the stack flushes everything and, when a compression stage is
//! present, shuts the write side down so the final frame is emitted.

use std::fmt;
use std::io;
use std::num::NonZeroU64;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use super::compression::CodecStage;
use super::counting::{CountingReader, CountingWriter, TrafficCounters};
use super::throttle::ThrottledWriter;

pub type BoxedReader<'a> = Box<dyn AsyncRead + Send + Unpin + 'a>;
pub type BoxedWriter<'a> = Box<dyn AsyncWrite + Send + Unpin + 'a>;

pub enum Layer {
    /// Count bytes on both halves.
    Counting(TrafficCounters),
    /// Pace the write half at this many bytes per second.
    Throttle(NonZeroU64),
    Compression(Arc<dyn CodecStage>),
}

impl Layer {
    fn name(&self) -> &'static str {
        match self {
            Layer::Counting(_) => "counting",
            Layer::Throttle(_) => "throttle",
            Layer::Compression(stage) => stage.name(),
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct LayerStack<'a> {
    reader: BufReader<BoxedReader<'a>>,
    writer: BufWriter<BoxedWriter<'a>>,
    layers: Vec<&'static str>,
    compressed: bool,
}

impl<'a> LayerStack<'a> {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'a,
        W: AsyncWrite + Send + Unpin + 'a,
    {
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: BufWriter::new(Box::new(writer)),
            layers: Vec::new(),
            compressed: false,
        }
    }

    /// Wrap the current halves in `layer`.
    ///
    /// Fails if either buffer still holds data, since those bytes were
    /// produced or consumed under the previous encoding.
    pub fn push(self, layer: Layer) -> io::Result<Self> {
        if !self.reader.buffer().is_empty() || !self.writer.buffer().is_empty() {
            return Err(io::Error::other(format!(
                "cannot add {} layer while data is buffered",
                layer.name()
            )));
        }
        let name = layer.name();
        let mut compressed = self.compressed;
        let reader = self.reader.into_inner();
        let writer = self.writer.into_inner();

        let (reader, writer): (BoxedReader<'a>, BoxedWriter<'a>) = match layer {
            Layer::Counting(counters) => (
                Box::new(CountingReader::new(reader, counters.clone())),
                Box::new(CountingWriter::new(writer, counters)),
            ),
            Layer::Throttle(limit) => (reader, Box::new(ThrottledWriter::new(writer, limit))),
            Layer::Compression(stage) => {
                compressed = true;
                (stage.wrap_reader(reader), stage.wrap_writer(writer))
            }
        };

        let mut layers = self.layers;
        layers.push(name);
        Ok(Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            layers,
            compressed,
        })
    }

    /// Both halves at once, for driving a session.
    pub fn halves(&mut self) -> (&mut BufReader<BoxedReader<'a>>, &mut BufWriter<BoxedWriter<'a>>) {
        (&mut self.reader, &mut self.writer)
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Layer names, innermost first.
    pub fn layers(&self) -> &[&'static str] {
        &self.layers
    }

    /// Flush all layers; finish the compressed frame if there is one.
    ///
    /// Called once the session's final reply has been exchanged. A peer that
    /// hung up by then cannot take the frame epilogue, which is not an error.
    pub async fn close(mut self) -> io::Result<()> {
        let result = match self.writer.flush().await {
            Ok(()) if self.compressed => self.writer.shutdown().await,
            other => other,
        };
        match result {
            Err(e) if self.compressed && is_disconnect(&e) => {
                debug!(error = %e, "Peer left before the compressed stream was finished");
                Ok(())
            }
            other => other,
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::ConnectionReset
    )
}
