use crate::config::CodecOptions;
use bytes::BytesMut;
use std::io;
use tracing::debug;
use zstd::stream::raw::{Decoder as RawDecoder, Encoder as RawEncoder, Operation, OutBuffer};

/// Size of the scratch buffer the codec writes into before copying to the caller's output.
const SCRATCH_SIZE: usize = 32 * 1024;

/// Turns a zstd failure into the `InvalidData` error surfaced on reads and writes.
pub(crate) fn codec_error(err: io::Error) -> io::Error {
    if err.kind() == io::ErrorKind::InvalidData {
        return err;
    }
    io::Error::new(io::ErrorKind::InvalidData, format!("zstd: {}", err))
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "zstd: codec already closed")
}

/// Streaming zstd compressor.
///
/// Output is appended to a caller supplied buffer so the same encoder can feed
/// either a connection or an in-process relay.
pub struct Encoder {
    raw: RawEncoder<'static>,
    scratch: Box<[u8]>,
    closed: bool,
}

impl Encoder {
    pub fn new(options: &CodecOptions) -> io::Result<Encoder> {
        let level = options.level.get();
        let raw = match &options.dictionary {
            Some(dictionary) => RawEncoder::with_dictionary(level, dictionary.as_bytes()),
            None => RawEncoder::new(level),
        }
        .map_err(codec_error)?;

        Ok(Encoder {
            raw,
            scratch: vec![0; SCRATCH_SIZE].into_boxed_slice(),
            closed: false,
        })
    }

    /// Compresses `input`. Some or all of the result may stay buffered inside
    /// zstd until [`Encoder::flush`] or [`Encoder::close`].
    pub fn encode(&mut self, input: &[u8], output: &mut BytesMut) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }

        let mut input = input;
        while !input.is_empty() {
            let status = self
                .raw
                .run_on_buffers(input, &mut self.scratch[..])
                .map_err(codec_error)?;
            output.extend_from_slice(&self.scratch[..status.bytes_written]);
            input = &input[status.bytes_read..];
        }
        Ok(())
    }

    /// Emits a block holding everything submitted so far, so the peer can
    /// decode it without waiting for more input.
    pub fn flush(&mut self, output: &mut BytesMut) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }

        loop {
            let (remaining, written) = {
                let mut out = OutBuffer::around(&mut self.scratch[..]);
                let remaining = self.raw.flush(&mut out).map_err(codec_error)?;
                (remaining, out.pos())
            };
            output.extend_from_slice(&self.scratch[..written]);
            if remaining == 0 {
                return Ok(());
            }
        }
    }

    /// Compresses `input` and flushes it in one step. This is what every
    /// logical write goes through.
    pub fn encode_flush(&mut self, input: &[u8], output: &mut BytesMut) -> io::Result<()> {
        self.encode(input, output)?;
        self.flush(output)
    }

    /// Ends the zstd frame. Calling it again is a no-op.
    pub fn close(&mut self, output: &mut BytesMut) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }

        loop {
            let (remaining, written) = {
                let mut out = OutBuffer::around(&mut self.scratch[..]);
                let remaining = self.raw.finish(&mut out, true).map_err(codec_error)?;
                (remaining, out.pos())
            };
            output.extend_from_slice(&self.scratch[..written]);
            if remaining == 0 {
                break;
            }
        }
        self.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Streaming zstd decompressor fed with arbitrary slices of a compressed stream.
pub struct Decoder {
    raw: RawDecoder<'static>,
    scratch: Box<[u8]>,
    in_frame: bool,
    closed: bool,
}

impl Decoder {
    pub fn new(options: &CodecOptions) -> io::Result<Decoder> {
        let raw = match &options.dictionary {
            Some(dictionary) => RawDecoder::with_dictionary(dictionary.as_bytes()),
            None => RawDecoder::new(),
        }
        .map_err(codec_error)?;

        Ok(Decoder {
            raw,
            scratch: vec![0; SCRATCH_SIZE].into_boxed_slice(),
            in_frame: false,
            closed: false,
        })
    }

    /// Decompresses `input`, appending whatever can be decoded so far. It is
    /// normal for a short input to produce no output at all.
    pub fn decode(&mut self, input: &[u8], output: &mut BytesMut) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }

        let mut input = input;
        loop {
            let status = self
                .raw
                .run_on_buffers(input, &mut self.scratch[..])
                .map_err(codec_error)?;
            output.extend_from_slice(&self.scratch[..status.bytes_written]);
            input = &input[status.bytes_read..];
            self.in_frame = status.remaining != 0;

            // a full scratch buffer may mean zstd still holds decoded bytes
            if input.is_empty() && status.bytes_written < self.scratch.len() {
                return Ok(());
            }
        }
    }

    /// Releases the decoder. Input that stopped inside a frame is logged but
    /// not treated as an error: peers commonly drop the connection without
    /// ending their frame.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.in_frame {
            debug!("compressed input ended inside a zstd frame");
        }
        self.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
