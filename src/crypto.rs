use std::cmp;
use std::io::{self, Read, Write};

use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::symm::{Cipher, Crypter, Mode};
use thiserror::Error;
use zeroize::Zeroize;

// OpenSSL "enc" compatible framing: the literal tag, then 8 salt bytes,
// then AES-256-CBC ciphertext with PKCS#7 padding. Key and IV come from
// PBKDF2-HMAC-SHA256 over the password and salt.
const OPENSSL_TAG: &[u8; 8] = b"Salted__";
const PBKDF2_ROUNDS: usize = 10_000;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const BLOCK_SIZE: usize = 16;

// 64Kb ciphertext frame buffer
const CHUNK_SIZE: usize = 64 * 1024;

pub const SALT_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid OpenSSL header")]
    BadHeader,
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("padding violation")]
    Padding,
    #[error("cipher failure: {0}")]
    Cipher(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<CryptoError> for io::Error {
    fn from(err: CryptoError) -> io::Error {
        match err {
            CryptoError::Io(err) => err,
            CryptoError::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            err => io::Error::new(io::ErrorKind::InvalidData, err),
        }
    }
}

/// Draw 8 bytes from the system entropy source. Used for the per-stream
/// cipher salt and for the per-archive hash prefix.
pub fn gen_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    openssl::rand::rand_bytes(&mut salt)?;
    Ok(salt)
}

fn new_crypter(
    mode: Mode,
    password: &[u8],
    salt: &[u8; SALT_LEN],
) -> Result<Crypter, CryptoError> {
    let mut key_iv = [0u8; KEY_LEN + IV_LEN];
    pbkdf2_hmac(
        password,
        salt,
        PBKDF2_ROUNDS,
        MessageDigest::sha256(),
        &mut key_iv,
    )?;

    let crypter = Crypter::new(
        Cipher::aes_256_cbc(),
        mode,
        &key_iv[..KEY_LEN],
        Some(&key_iv[KEY_LEN..]),
    );
    key_iv.zeroize();

    Ok(crypter?)
}

/// Encrypting sink. Plaintext written in is buffered to cipher blocks and
/// flows out to the inner writer as ciphertext; `finish` applies the
/// PKCS#7 tail. Composes under any other `Write` layer.
pub struct Encrypter<W: Write> {
    inner: W,
    crypter: Crypter,
    out_buf: Vec<u8>,
}

pub fn encrypt<W: Write>(mut sink: W, password: &[u8]) -> Result<Encrypter<W>, CryptoError> {
    let salt = gen_salt()?;
    sink.write_all(OPENSSL_TAG)?;
    sink.write_all(&salt)?;

    Ok(Encrypter {
        inner: sink,
        crypter: new_crypter(Mode::Encrypt, password, &salt)?,
        out_buf: vec![0u8; CHUNK_SIZE + BLOCK_SIZE],
    })
}

impl<W: Write> Encrypter<W> {
    /// Pad and flush the final block, returning the inner writer.
    pub fn finish(mut self) -> Result<W, CryptoError> {
        let count = self.crypter.finalize(&mut self.out_buf)?;
        self.inner.write_all(&self.out_buf[..count])?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Encrypter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let take = cmp::min(buf.len(), CHUNK_SIZE);
        let count = self
            .crypter
            .update(&buf[..take], &mut self.out_buf)
            .map_err(|err| io::Error::from(CryptoError::Cipher(err)))?;
        self.inner.write_all(&self.out_buf[..count])?;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypting source. Ciphertext is pulled from the inner reader; the
/// final block is held back until end-of-stream so the padding can be
/// validated and stripped.
pub struct Decrypter<R: Read> {
    inner: R,
    crypter: Crypter,
    in_buf: Box<[u8]>,
    scratch: Vec<u8>,
    out_buf: Vec<u8>,
    total_in: u64,
    finalized: bool,
}

pub fn decrypt<R: Read>(mut source: R, password: &[u8]) -> Result<Decrypter<R>, CryptoError> {
    let mut tag = [0u8; 8];
    read_exact_or_eof(&mut source, &mut tag)?;
    if &tag != OPENSSL_TAG {
        return Err(CryptoError::BadHeader);
    }

    let mut salt = [0u8; SALT_LEN];
    read_exact_or_eof(&mut source, &mut salt)?;

    Ok(Decrypter {
        inner: source,
        crypter: new_crypter(Mode::Decrypt, password, &salt)?,
        in_buf: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
        scratch: vec![0u8; CHUNK_SIZE + BLOCK_SIZE],
        out_buf: Vec::new(),
        total_in: 0,
        finalized: false,
    })
}

fn read_exact_or_eof<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<(), CryptoError> {
    source.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => CryptoError::UnexpectedEof,
        _ => CryptoError::Io(err),
    })
}

impl<R: Read> Decrypter<R> {
    // Copy decrypted bytes out to the caller, keeping any leftover
    fn serve(&mut self, buf: &mut [u8]) -> usize {
        let split_at = cmp::min(self.out_buf.len(), buf.len());
        buf[..split_at].copy_from_slice(&self.out_buf[..split_at]);
        self.out_buf.drain(..split_at);
        split_at
    }

    fn finalize(&mut self) -> io::Result<()> {
        // Anything short of one cipher block cannot carry valid padding
        if self.total_in < BLOCK_SIZE as u64 || self.total_in % BLOCK_SIZE as u64 != 0 {
            return Err(CryptoError::UnexpectedEof.into());
        }

        let mut tail = [0u8; 2 * BLOCK_SIZE];
        let count = self
            .crypter
            .finalize(&mut tail)
            .map_err(|_| io::Error::from(CryptoError::Padding))?;
        self.out_buf.extend_from_slice(&tail[..count]);
        self.finalized = true;
        Ok(())
    }
}

impl<R: Read> Read for Decrypter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            // 1. Serve whatever is already decrypted
            if !self.out_buf.is_empty() {
                return Ok(self.serve(buf));
            }
            if self.finalized {
                return Ok(0);
            }

            // 2. Pull more ciphertext; end-of-stream strips the padding
            let len = self.inner.read(&mut self.in_buf)?;
            if len == 0 {
                self.finalize()?;
                if self.out_buf.is_empty() {
                    return Ok(0);
                }
                continue;
            }
            self.total_in += len as u64;

            // 3. Decrypt full blocks; the crypter retains the trailing
            //    block until finalization
            let count = self
                .crypter
                .update(&self.in_buf[..len], &mut self.scratch)
                .map_err(|err| io::Error::from(CryptoError::Cipher(err)))?;
            self.out_buf.extend_from_slice(&self.scratch[..count]);
        }
    }
}

#[cfg(test)]
mod test_encrypt_decrypt_roundtrip {
    use super::*;
    use std::io::Cursor;

    const PASSWORD: &[u8] = b"hunter2";

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let mut enc = encrypt(Vec::new(), PASSWORD).unwrap();
        enc.write_all(data).unwrap();
        let sealed = enc.finish().unwrap();

        let mut dec = decrypt(Cursor::new(sealed), PASSWORD).unwrap();
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn empty_roundtrip() {
        assert_eq!(roundtrip(b""), b"");
    }

    #[test]
    fn small_roundtrip() {
        assert_eq!(roundtrip(b"Hello World!"), b"Hello World!");
    }

    #[test]
    fn exactly_one_block_roundtrip() {
        let data = [0x41u8; BLOCK_SIZE];
        assert_eq!(roundtrip(&data), &data);
    }

    #[test]
    fn big_data_roundtrip() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 / 2)).map(|i| (i % 251) as u8).collect();
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn awkward_read_sizes() {
        let data: Vec<u8> = (0..1000).map(|i| (i % 7) as u8).collect();

        let mut enc = encrypt(Vec::new(), PASSWORD).unwrap();
        enc.write_all(&data).unwrap();
        let sealed = enc.finish().unwrap();

        let mut dec = decrypt(Cursor::new(sealed), PASSWORD).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            match dec.read(&mut buf).unwrap() {
                0 => break,
                n => out.extend_from_slice(&buf[..n]),
            }
        }
        assert_eq!(out, data);
    }

    #[test]
    fn dribbled_writes() {
        let data: Vec<u8> = (0..100).collect();

        let mut enc = encrypt(Vec::new(), PASSWORD).unwrap();
        for byte in &data {
            enc.write_all(std::slice::from_ref(byte)).unwrap();
        }
        let sealed = enc.finish().unwrap();

        let mut dec = decrypt(Cursor::new(sealed), PASSWORD).unwrap();
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }
}

#[cfg(test)]
mod test_wire_format {
    use super::*;
    use std::io::Cursor;

    const PASSWORD: &[u8] = b"hunter2";

    fn seal(data: &[u8]) -> Vec<u8> {
        let mut enc = encrypt(Vec::new(), PASSWORD).unwrap();
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn header_tag_and_salt_lead_the_stream() {
        let sealed = seal(b"abc");
        assert_eq!(&sealed[..8], b"Salted__");
        // tag + salt + one padded block
        assert_eq!(sealed.len(), 8 + SALT_LEN + BLOCK_SIZE);
    }

    #[test]
    fn aligned_plaintext_gains_a_full_padding_block() {
        let sealed = seal(&[0u8; 2 * BLOCK_SIZE]);
        assert_eq!(sealed.len(), 8 + SALT_LEN + 3 * BLOCK_SIZE);
    }

    #[test]
    fn bad_header_is_rejected() {
        let mut sealed = seal(b"abc");
        sealed[0] = b'X';
        match decrypt(Cursor::new(sealed), PASSWORD) {
            Err(CryptoError::BadHeader) => (),
            other => panic!("expected BadHeader, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncated_salt_is_rejected() {
        let sealed = seal(b"abc");
        match decrypt(Cursor::new(sealed[..12].to_vec()), PASSWORD) {
            Err(CryptoError::UnexpectedEof) => (),
            other => panic!("expected UnexpectedEof, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let sealed = seal(b"some plaintext that spans blocks");
        // Drop the final block so no padding can be recovered
        let cut = sealed.len() - BLOCK_SIZE - 3;
        let mut dec = decrypt(Cursor::new(sealed[..cut].to_vec()), PASSWORD).unwrap();
        let err = dec.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn missing_ciphertext_is_rejected() {
        let sealed = seal(b"abc");
        let mut dec = decrypt(Cursor::new(sealed[..16].to_vec()), PASSWORD).unwrap();
        let err = dec.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn wrong_password_fails_without_plaintext() {
        let sealed = seal(b"attack at dawn");
        let mut dec = decrypt(Cursor::new(sealed), b"not-hunter2").unwrap();
        let mut out = Vec::new();
        // A wrong key ends in a padding error except for the rare garbage
        // block that happens to look padded; it never recovers plaintext.
        let result = dec.read_to_end(&mut out);
        assert!(result.is_err() || out != b"attack at dawn");
        assert!(!out.windows(4).any(|w| w == b"dawn"));
    }
}
