//! HTTP/2 flow control (RFC 7540 Section 5.2)
//!
//! Two windows exist per direction: one for the connection and one per stream.
//! [`SendWindow`] tracks what the peer lets us send and can go negative when
//! the peer shrinks SETTINGS_INITIAL_WINDOW_SIZE. [`RecvWindow`] tracks what we
//! let the peer send and decides when to replenish it with WINDOW_UPDATE.

use super::error::{Error, Result};
use super::settings::MAX_WINDOW_SIZE;

/// Outbound window granted by the peer
#[derive(Debug, Clone)]
pub struct SendWindow {
    size: i64,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        SendWindow {
            size: initial as i64,
        }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// Bytes that may be sent right now
    pub fn available(&self) -> usize {
        self.size.max(0) as usize
    }

    /// Account for sent bytes; the caller has checked [`SendWindow::available`]
    pub fn consume(&mut self, amount: usize) {
        self.size -= amount as i64;
    }

    /// Apply a WINDOW_UPDATE increment
    pub fn increase(&mut self, increment: u32) -> Result<()> {
        let new_size = self.size + increment as i64;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "window {} exceeds 2^31-1",
                new_size
            )));
        }
        self.size = new_size;
        Ok(())
    }

    /// Shift by the difference between an old and new initial window size
    pub fn adjust(&mut self, delta: i64) -> Result<()> {
        let new_size = self.size + delta;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "window {} exceeds 2^31-1 after SETTINGS change",
                new_size
            )));
        }
        self.size = new_size;
        Ok(())
    }
}

/// Inbound window we granted to the peer
#[derive(Debug, Clone)]
pub struct RecvWindow {
    initial: u32,
    /// Bytes the peer may still send
    size: i64,
    /// Bytes the application consumed that were not yet handed back
    unacked: u32,
}

impl RecvWindow {
    pub fn new(initial: u32) -> Self {
        RecvWindow {
            initial,
            size: initial as i64,
            unacked: 0,
        }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// Account for a received DATA payload
    pub fn receive(&mut self, amount: usize) -> Result<()> {
        if amount as i64 > self.size {
            return Err(Error::FlowControl(format!(
                "peer sent {} bytes into a window of {}",
                amount, self.size
            )));
        }
        self.size -= amount as i64;
        Ok(())
    }

    /// Record bytes the application processed
    ///
    /// Returns the WINDOW_UPDATE increment to send once half the initial
    /// window has been consumed.
    pub fn acknowledge(&mut self, amount: usize) -> Option<u32> {
        self.unacked = self.unacked.saturating_add(amount as u32);
        if self.unacked == 0 || self.unacked < self.initial / 2 {
            return None;
        }
        let increment = self.unacked;
        self.unacked = 0;
        self.size += increment as i64;
        Some(increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_window_consume_and_increase() {
        let mut window = SendWindow::new(100);
        window.consume(60);
        assert_eq!(window.available(), 40);
        window.consume(40);
        assert_eq!(window.available(), 0);
        window.increase(25).unwrap();
        assert_eq!(window.available(), 25);
    }

    #[test]
    fn test_send_window_overflow() {
        let mut window = SendWindow::new(MAX_WINDOW_SIZE);
        assert!(matches!(window.increase(1), Err(Error::FlowControl(_))));
    }

    #[test]
    fn test_send_window_can_go_negative() {
        let mut window = SendWindow::new(100);
        window.consume(80);
        window.adjust(-50).unwrap();
        assert_eq!(window.size(), -30);
        assert_eq!(window.available(), 0);
        window.increase(40).unwrap();
        assert_eq!(window.available(), 10);
    }

    #[test]
    fn test_recv_window_rejects_overrun() {
        let mut window = RecvWindow::new(10);
        window.receive(10).unwrap();
        assert!(window.receive(1).is_err());
    }

    #[test]
    fn test_recv_window_replenishes_at_half() {
        let mut window = RecvWindow::new(100);
        window.receive(60).unwrap();
        assert_eq!(window.acknowledge(30), None);
        assert_eq!(window.acknowledge(30), Some(60));
        assert_eq!(window.size(), 100);
        assert_eq!(window.acknowledge(0), None);
    }
}
