//! Audio acquisition: the null sink and the PCM sources reading it

pub mod sink;
pub mod source;

pub use sink::NullSink;
pub use source::{channel_source, AudioFormat, AudioSource, ChannelSource, ParecSource, ReaderSource};
