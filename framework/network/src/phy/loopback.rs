use heapless::Deque;

use super::{Device, SerialError, Word9};

/// A wired-AND bus stand-in for tests.
///
/// Every transmitted word comes straight back as the own echo, after
/// anything a test has injected ahead of it. Injected faults surface
/// on the read side like transceiver errors would.
#[derive(Debug, Default)]
pub struct Loopback {
    rx: Deque<Result<Word9, SerialError>, 512>,
    tx_log: Deque<Word9, 512>,
}

impl Loopback {
    pub fn new() -> Loopback {
        Loopback::default()
    }

    /// Queue a word as if a peer had sent it.
    pub fn inject(&mut self, word: Word9) {
        self.rx.push_back(Ok(word)).unwrap();
    }

    pub fn inject_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.inject(Word9::data(b));
        }
    }

    /// Queue a receive fault.
    pub fn inject_error(&mut self, err: SerialError) {
        self.rx.push_back(Err(err)).unwrap();
    }

    /// Everything transmitted so far, oldest first.
    pub fn take_tx(&mut self) -> heapless::Vec<Word9, 512> {
        let mut out = heapless::Vec::new();
        while let Some(w) = self.tx_log.pop_front() {
            out.push(w).unwrap();
        }
        out
    }
}

impl Device for Loopback {
    fn read(&mut self) -> nb::Result<Word9, SerialError> {
        match self.rx.pop_front() {
            Some(Ok(word)) => Ok(word),
            Some(Err(err)) => Err(nb::Error::Other(err)),
            None => Err(nb::Error::WouldBlock),
        }
    }

    fn write(&mut self, word: Word9) -> nb::Result<(), SerialError> {
        self.tx_log.push_back(word).map_err(|_| nb::Error::WouldBlock)?;
        // wired-AND: the transmitter hears itself
        self.rx.push_back(Ok(word)).map_err(|_| nb::Error::WouldBlock)?;
        Ok(())
    }
}
