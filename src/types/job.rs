use bytes::Bytes;

/// A job as returned by the `peek` family: its ID and body, without any
/// reservation attached.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Job {
    pub id: u64,
    pub data: Bytes,
}
