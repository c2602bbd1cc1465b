//! Appender forwarding output through a channel.

use std::io;

use perfmon_types::{IntervalData, ThreadTraceData};
use tokio::sync::mpsc;

use super::Appender;

/// What a [`ChannelAppender`] forwards.
#[derive(Debug, Clone, PartialEq)]
pub enum AppenderOutput {
    Interval(IntervalData),
    Trace(ThreadTraceData),
}

/// Sends every output into a bounded channel.
///
/// This is useful for integrating with your own snapshot handling. Sending
/// is best effort: when the channel is full the output is dropped.
///
/// ```rust
/// use std::sync::Arc;
/// use perfmon_sdk::{Appender, ChannelAppender, Registry};
///
/// let (appender, mut rx) = ChannelAppender::new(16);
/// let appender = Arc::new(appender);
/// let registry = Registry::builder()
///     .appender_class("channel", move |_| Ok(appender.clone() as Arc<dyn Appender>))
///     .build()
///     .unwrap();
/// # drop(registry);
/// # assert!(rx.try_recv().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ChannelAppender {
    tx: mpsc::Sender<AppenderOutput>,
}

impl ChannelAppender {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<AppenderOutput>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl Appender for ChannelAppender {
    fn output_interval(&self, data: &IntervalData) -> io::Result<()> {
        // Best effort send (don't block if channel is full)
        let _ = self.tx.try_send(AppenderOutput::Interval(data.clone()));
        Ok(())
    }

    fn output_trace(&self, trace: &ThreadTraceData) -> io::Result<()> {
        let _ = self.tx.try_send(AppenderOutput::Trace(trace.clone()));
        Ok(())
    }
}
