//! Line splitting and fan-out for captured child process output.
//!
//! Factorio's stdout arrives as arbitrarily sized chunks whose boundaries do
//! not align with line boundaries. [`LineSplitter`] reassembles them into
//! complete lines; [`LineFanout`] delivers each line to every subscriber in
//! arrival order.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Stateful decoder turning a chunked byte stream into discrete lines.
///
/// Lines end at `\n` or `\r\n`; the terminator is stripped. A lone `\r` is
/// ordinary content. After [`LineSplitter::push`] returns, the internal buffer
/// never contains a full terminator.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every line it completed.
    ///
    /// An empty chunk is a no-op; a chunk holding several terminators yields
    /// several lines at once.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(index) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=index).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush the residual unterminated line at end-of-stream, if any.
    ///
    /// Returns `Some` at most once per stream; subsequent calls see an empty
    /// buffer.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// One-producer, many-consumer line broadcast.
///
/// Each subscriber gets its own unbounded channel, so every subscriber sees
/// every line published after it subscribed, in strict FIFO order, with no
/// drops even when it lags behind the producer.
#[derive(Debug, Clone, Default)]
pub struct LineFanout {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>,
}

impl LineFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Lines published before this call are not
    /// replayed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver one line to every live subscriber, dropping subscribers whose
    /// receiver has gone away.
    pub fn publish(&self, line: String) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(line.clone()).is_ok());
    }

    /// Signal end-of-stream by closing every subscriber channel.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(splitter: &mut LineSplitter, chunks: &[&str]) -> Vec<String> {
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(splitter.push(chunk.as_bytes()));
        }
        lines.extend(splitter.finish());
        lines
    }

    #[test]
    fn splits_terminated_chunks() {
        let mut splitter = LineSplitter::new();
        let lines = feed(&mut splitter, &["REPLAY_SCRIPT:One\n", "REPLAY_SCRIPT:Two\n"]);
        assert_eq!(lines, ["REPLAY_SCRIPT:One", "REPLAY_SCRIPT:Two"]);
    }

    #[test]
    fn reassembles_lines_across_chunk_boundaries() {
        let mut splitter = LineSplitter::new();
        let lines = feed(&mut splitter, &["hel", "lo\nwor", "ld\n"]);
        assert_eq!(lines, ["hello", "world"]);
    }

    #[test]
    fn one_chunk_can_yield_many_lines() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"a\nb\nc\n"), ["a", "b", "c"]);
    }

    #[test]
    fn flushes_unterminated_tail_exactly_once() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"partial"), Vec::<String>::new());
        assert_eq!(splitter.finish(), Some("partial".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn strips_crlf_terminators() {
        let mut splitter = LineSplitter::new();
        let lines = feed(&mut splitter, &["one\r\ntwo\r", "\n"]);
        assert_eq!(lines, ["one", "two"]);
    }

    #[test]
    fn lone_carriage_return_is_content() {
        let mut splitter = LineSplitter::new();
        let lines = feed(&mut splitter, &["a\rb\n"]);
        assert_eq!(lines, ["a\rb"]);
    }

    #[test]
    fn empty_chunks_are_noops() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"").is_empty());
        assert_eq!(splitter.push(b"x\n"), ["x"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn line_count_is_independent_of_chunking() {
        let input = "one\ntwo\r\nthree\nfour";
        for split_at in 0..input.len() {
            let (a, b) = input.split_at(split_at);
            let mut splitter = LineSplitter::new();
            let lines = feed(&mut splitter, &[a, b]);
            assert_eq!(lines, ["one", "two", "three", "four"], "split at {split_at}");
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_line_in_order() {
        let fanout = LineFanout::new();
        let mut first = fanout.subscribe();
        let mut second = fanout.subscribe();

        fanout.publish("one".to_string());
        fanout.publish("two".to_string());
        fanout.close();

        let mut seen_first = Vec::new();
        while let Some(line) = first.recv().await {
            seen_first.push(line);
        }
        let mut seen_second = Vec::new();
        while let Some(line) = second.recv().await {
            seen_second.push(line);
        }

        assert_eq!(seen_first, ["one", "two"]);
        assert_eq!(seen_second, ["one", "two"]);
    }

    #[tokio::test]
    async fn dropped_subscribers_do_not_block_publishing() {
        let fanout = LineFanout::new();
        let rx = fanout.subscribe();
        drop(rx);

        let mut live = fanout.subscribe();
        fanout.publish("still here".to_string());
        fanout.close();

        assert_eq!(live.recv().await.as_deref(), Some("still here"));
        assert_eq!(live.recv().await, None);
    }
}
