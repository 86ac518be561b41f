use std::fmt;

/// Connection phase, encoded as a small bitmask.
///
/// The read bits are not mutually exclusive with `REQUEST_PROCESSED`: the
/// response can finish while the request body is still streaming in. The
/// empty mask (`PROCESSING`) means the body is exhausted and the handler
/// owns the request.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct State(u8);

impl State {
    /// The request line and headers are still being parsed
    pub const READ_HEADERS: State = State(1 << 0);
    /// The head is done; body bytes stream into the handler
    pub const READ_DATA: State = State(1 << 1);
    /// The response has been fully produced; only meaningful while a body
    /// is still being drained
    pub const REQUEST_PROCESSED: State = State(1 << 2);
    /// No byte of the next request has been seen yet; cleared on the first
    /// byte, which also arms the request-start timestamp
    pub const WAITING_FIRST_DATA: State = State(1 << 3);
    /// Body exhausted (or absent), awaiting the handler's response
    pub const PROCESSING: State = State(0);

    pub fn initial() -> State {
        State(Self::READ_HEADERS.0 | Self::WAITING_FIRST_DATA.0)
    }

    pub fn contains(self, bit: State) -> bool {
        self.0 & bit.0 == bit.0 && bit.0 != 0
    }

    pub fn insert(&mut self, bit: State) {
        self.0 |= bit.0;
    }

    pub fn remove(&mut self, bit: State) {
        self.0 &= !bit.0;
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("processing");
        }
        let mut bits = f.debug_list();
        for (bit, name) in [
            (Self::READ_HEADERS, "read_headers"),
            (Self::READ_DATA, "read_data"),
            (Self::REQUEST_PROCESSED, "request_processed"),
            (Self::WAITING_FIRST_DATA, "waiting_first_data"),
        ] {
            if self.contains(bit) {
                bits.entry(&name);
            }
        }
        bits.finish()
    }
}
