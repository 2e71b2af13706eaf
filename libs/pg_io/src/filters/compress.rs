//! Compress / decompress filters (gzip via `flate2`, zstd via `zstd`).
//!
//! Both crates' streaming writers buffer their compressed output inside
//! an owned `Vec<u8>`; each `feed` call writes new input into the
//! encoder/decoder and copies out whatever compressed bytes became
//! available since the last call, so output still reaches the caller
//! incrementally even though the codec itself isn't chunk-aligned.

use std::io::Write;

use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use pg_util::CoreError;

use crate::buffer::Buffer;
use crate::filter::Filter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Zstd,
}

enum Encoder {
    Gzip(GzEncoder<Vec<u8>>),
    Zstd(Box<zstd::stream::write::Encoder<'static, Vec<u8>>>),
}

pub struct CompressFilter {
    encoder: Option<Encoder>,
    emitted: usize,
    done: bool,
}

impl CompressFilter {
    pub fn new(codec: Codec, level: i32) -> Result<Self, CoreError> {
        let encoder = match codec {
            Codec::Gzip => Encoder::Gzip(GzEncoder::new(Vec::new(), Compression::new(level.clamp(0, 9) as u32))),
            Codec::Zstd => Encoder::Zstd(Box::new(
                zstd::stream::write::Encoder::new(Vec::new(), level)
                    .map_err(|e| CoreError::Crypto(format!("zstd encoder init failed: {e}")))?,
            )),
        };
        Ok(Self {
            encoder: Some(encoder),
            emitted: 0,
            done: false,
        })
    }

    fn written_so_far(enc: &Encoder) -> &[u8] {
        match enc {
            Encoder::Gzip(e) => e.get_ref().as_slice(),
            Encoder::Zstd(e) => e.get_ref().as_slice(),
        }
    }
}

impl Filter for CompressFilter {
    fn feed(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<usize, CoreError> {
        match input {
            Some(bytes) => {
                let enc = self.encoder.as_mut().expect("feed after done");
                match enc {
                    Encoder::Gzip(e) => e.write_all(bytes),
                    Encoder::Zstd(e) => e.write_all(bytes),
                }
                .map_err(|e| CoreError::io("compress", "<stream>", e))?;

                let available = Self::written_so_far(enc);
                let new = &available[self.emitted..];
                output.cat(new)?;
                self.emitted += new.len();
                Ok(bytes.len())
            }
            None => {
                if !self.done {
                    if let Some(enc) = self.encoder.take() {
                        let final_buf = match enc {
                            Encoder::Gzip(e) => e.finish(),
                            Encoder::Zstd(e) => e.finish(),
                        }
                        .map_err(|e| CoreError::io("compress-finish", "<stream>", e))?;
                        let new = &final_buf[self.emitted..];
                        output.cat(new)?;
                        self.emitted = final_buf.len();
                    }
                    self.done = true;
                }
                Ok(0)
            }
        }
    }

    fn done(&self) -> bool {
        self.done
    }

    fn name(&self) -> &'static str {
        "compress"
    }
}

enum Decoder {
    Gzip(Box<GzDecoder<Vec<u8>>>),
    Zstd(Box<zstd::stream::write::Decoder<'static, Vec<u8>>>),
}

pub struct DecompressFilter {
    decoder: Option<Decoder>,
    emitted: usize,
    done: bool,
}

impl DecompressFilter {
    pub fn new(codec: Codec) -> Result<Self, CoreError> {
        let decoder = match codec {
            Codec::Gzip => Decoder::Gzip(Box::new(GzDecoder::new(Vec::new()))),
            Codec::Zstd => Decoder::Zstd(Box::new(
                zstd::stream::write::Decoder::new(Vec::new())
                    .map_err(|e| CoreError::Crypto(format!("zstd decoder init failed: {e}")))?,
            )),
        };
        Ok(Self {
            decoder: Some(decoder),
            emitted: 0,
            done: false,
        })
    }

    fn written_so_far(dec: &Decoder) -> &[u8] {
        match dec {
            Decoder::Gzip(d) => d.get_ref().as_slice(),
            Decoder::Zstd(d) => d.get_ref().as_slice(),
        }
    }
}

impl Filter for DecompressFilter {
    fn feed(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<usize, CoreError> {
        match input {
            Some(bytes) => {
                let dec = self.decoder.as_mut().expect("feed after done");
                match dec {
                    Decoder::Gzip(d) => d.write_all(bytes),
                    Decoder::Zstd(d) => d.write_all(bytes),
                }
                .map_err(|e| CoreError::io("decompress", "<stream>", e))?;

                let available = Self::written_so_far(dec);
                let new = &available[self.emitted..];
                output.cat(new)?;
                self.emitted += new.len();
                Ok(bytes.len())
            }
            None => {
                if !self.done {
                    if let Some(dec) = self.decoder.take() {
                        let final_buf = match dec {
                            Decoder::Gzip(d) => d.finish(),
                            Decoder::Zstd(d) => d.finish(),
                        }
                        .map_err(|e| CoreError::io("decompress-finish", "<stream>", e))?;
                        let new = &final_buf[self.emitted..];
                        output.cat(new)?;
                        self.emitted = final_buf.len();
                    }
                    self.done = true;
                }
                Ok(0)
            }
        }
    }

    fn done(&self) -> bool {
        self.done
    }

    fn name(&self) -> &'static str {
        "decompress"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(codec: Codec, data: &[u8]) {
        let mut enc = CompressFilter::new(codec, 3).unwrap();
        let mut compressed = Buffer::new(data.len() + 256);
        enc.feed(Some(data), &mut compressed).unwrap();
        enc.feed(None, &mut compressed).unwrap();

        let mut dec = DecompressFilter::new(codec).unwrap();
        let mut plain = Buffer::new(data.len() + 256);
        dec.feed(Some(compressed.as_slice()), &mut plain).unwrap();
        dec.feed(None, &mut plain).unwrap();

        assert_eq!(plain.as_slice(), data);
    }

    #[test]
    fn gzip_round_trips() {
        round_trip(Codec::Gzip, b"the quick brown fox jumps over the lazy dog, repeated. ".repeat(20).as_slice());
    }

    #[test]
    fn zstd_round_trips() {
        round_trip(Codec::Zstd, b"the quick brown fox jumps over the lazy dog, repeated. ".repeat(20).as_slice());
    }
}
