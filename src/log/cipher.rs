/// Stream cipher applied to the data area of log pages.
///
/// `crypt` must be an involution at a fixed address: applying it twice with the
/// same address restores the input. The address is the log address of
/// `data[0]`, so partially written pages can be re-encrypted byte-for-byte as
/// they grow.
pub trait Cipher: Send + Sync {
    fn crypt(&self, address: u64, data: &mut [u8]);
}
