/// Types implementing BeanstalkSerialisable can be written to a Beanstalk
/// TCP connection, in either the client -> server or server -> client
/// direction.
pub trait BeanstalkSerialisable {
    /// Converts the value in question to its Beanstalk wire form, including
    /// the trailing CRLF.
    fn serialise_beanstalk(&self) -> Vec<u8>;
}
