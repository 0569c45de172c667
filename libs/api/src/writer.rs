use std::io;

/// Байтовый sink, в который producer пишет закодированные сообщения
/// (сокет, файл, консоль, ...).
///
/// Все методы **блокирующие**. Владелец — ровно один producer; sink
/// может быть заменён (reconnect, ротация), но никогда не разделяется.
pub trait BatchedWriter: io::Write + Send {
    /// Base name of the resource (file name, peer address, ...).
    fn name(&self) -> &str;

    /// Bytes written so far. For regular files the file length, for others
    /// whatever the sink can tell.
    fn size(&self) -> u64;

    /// Whether the underlying resource is still reachable.
    fn is_accessible(&self) -> bool;

    /// Read an acknowledgement from the peer, filling `buf` completely.
    /// Sinks without a response channel keep the default.
    fn read_response(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let _ = buf;
        Err(io::Error::new(io::ErrorKind::Unsupported, "sink does not support responses"))
    }

    /// Flush and release the resource.
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}
