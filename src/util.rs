use std::{
    io::{Error, ErrorKind, Result},
    os::fd::AsFd,
};

use rustix::io::{pread, pwrite, Errno};

/// Reads from `fd` at `offset` until the buffer is full or EOF is reached, retrying on EINTR.
///
/// Unlike `FileExt::read_exact_at()`, hitting EOF is not an error: the number of bytes actually
/// read is returned and the rest of the buffer is left untouched.  This is what we want for the
/// trailing partial page of a file-backed image.
pub(crate) fn pread_exactish(fd: impl AsFd, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;

    while done < buf.len() {
        match pread(fd.as_fd(), &mut buf[done..], offset + done as u64) {
            Ok(0) => break, // EOF
            Ok(n) => done += n,
            Err(Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(done)
}

/// Writes all of `buf` to `fd` at `offset`, retrying on EINTR.
pub(crate) fn pwrite_all(fd: impl AsFd, buf: &[u8], offset: u64) -> Result<()> {
    let mut done = 0;

    while done < buf.len() {
        match pwrite(fd.as_fd(), &buf[done..], offset + done as u64) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => done += n,
            Err(Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// A 32-byte key or seed in binary.
pub type Key32 = [u8; 32];

/// Parse a string containing a 32-byte value in hexadecimal form.
///
/// Surrounding whitespace is ignored (so the contents of a key file can be passed directly).
/// The rest must be exactly 64 characters of [0-9a-f], case insensitive.
///
/// In case of a failure to parse the string, this function returns ErrorKind::InvalidInput.
pub fn parse_hex32(string: impl AsRef<str>) -> Result<Key32> {
    let mut value = [0u8; 32];
    hex::decode_to_slice(string.as_ref().trim(), &mut value)
        .map_err(|source| Error::new(ErrorKind::InvalidInput, source))?;
    Ok(value)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_pread_exactish() {
        let mut tf = tempfile::tempfile().unwrap();
        tf.write_all(b"twelve bytes").unwrap();

        let mut buf = [0u8; 9];
        assert_eq!(pread_exactish(&tf, &mut buf, 0).unwrap(), 9);
        assert_eq!(&buf, b"twelve by");

        let mut buf = [b'_'; 9];
        assert_eq!(pread_exactish(&tf, &mut buf, 7).unwrap(), 5);
        assert_eq!(&buf, b"bytes____");

        // clean EOF
        assert_eq!(pread_exactish(&tf, &mut buf, 12).unwrap(), 0);
        assert_eq!(pread_exactish(&tf, &mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn test_pwrite_all() {
        let tf = tempfile::tempfile().unwrap();
        pwrite_all(&tf, b"hello", 3).unwrap();

        let mut buf = [b'_'; 8];
        assert_eq!(pread_exactish(&tf, &mut buf, 0).unwrap(), 8);
        assert_eq!(&buf, b"\0\0\0hello");
    }

    #[test]
    fn test_parse_hex32() {
        let valid = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let valid_caps = "00112233445566778899AABBCCDDEEFF00112233445566778899AABBCCDDEEFf";
        assert_eq!(hex::encode(parse_hex32(valid).unwrap()), valid);
        assert_eq!(hex::encode(parse_hex32(valid_caps).unwrap()), valid);
        assert_eq!(hex::encode(parse_hex32(format!("{valid}\n")).unwrap()), valid);

        fn assert_invalid(x: &str) {
            assert_eq!(parse_hex32(x).unwrap_err().kind(), ErrorKind::InvalidInput);
        }

        // empty
        assert_invalid("");
        // something randomly wrong
        assert_invalid("/etc/shadow");
        // too short
        assert_invalid("00112233445566778899aabbccddeeff00112233445566778899aabbccddeef");
        // too long
        assert_invalid("00112233445566778899aabbccddeeff00112233445566778899aabbccddeefff");
        // non-hex character
        assert_invalid("00112233445566778899aabbccddeeff00112233445566778899aabbccddeefg");
    }
}
