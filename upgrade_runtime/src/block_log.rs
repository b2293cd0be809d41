//! Append-only block log, binary protobuf frames.
//!
//! Storage format: length-prefixed protobuf frames.
//!   [4-byte LE length][ProtoBlock bytes][4-byte LE length][ProtoBlock bytes]...
//!
//! Rules:
//!   - strict append only, heights 1, 2, 3, ... with no gaps
//!   - fsync after every append
//!   - a truncated frame, an oversized frame or a height gap on read is
//!     reported as corruption

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::block::{decode_block, encode_block, Block};

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub struct BlockLog {
    path: PathBuf,
    last_height: u64,
}

impl BlockLog {
    /// Open or create a block log. Existing frames are read and checked to
    /// find the last committed height.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let last_height = if path.exists() {
            Self::read_all_from_file(path)?
                .last()
                .map(|b| b.height)
                .unwrap_or(0)
        } else {
            0
        };

        Ok(Self {
            path: path.to_path_buf(),
            last_height,
        })
    }

    pub fn append(&mut self, block: &Block) -> io::Result<()> {
        let expected = self.last_height + 1;
        if block.height != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "height violation in block log: expected {}, got {}",
                    expected, block.height
                ),
            ));
        }

        let buf = encode_block(block);
        let len = u32::try_from(buf.len())
            .ok()
            .filter(|len| (*len as usize) <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("block {} too large: {} bytes", block.height, buf.len()),
                )
            })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        {
            let mut writer = BufWriter::new(&mut file);
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(&buf)?;
            writer.flush()?;
        }
        file.sync_all()?;

        self.last_height = block.height;
        Ok(())
    }

    pub fn load_all(&self) -> io::Result<Vec<Block>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        Self::read_all_from_file(&self.path)
    }

    /// Blocks strictly above `height`, in order.
    pub fn load_after(&self, height: u64) -> io::Result<Vec<Block>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|b| b.height > height)
            .collect())
    }

    pub fn last_height(&self) -> u64 {
        self.last_height
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all_from_file(path: &Path) -> io::Result<Vec<Block>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut blocks: Vec<Block> = Vec::new();
        let mut len_buf = [0u8; 4];

        loop {
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len == 0 || len > MAX_FRAME_LEN {
                return Err(corrupt(format!(
                    "invalid frame length {} after height {}",
                    len,
                    blocks.len()
                )));
            }

            let mut frame = vec![0u8; len];
            reader.read_exact(&mut frame).map_err(|e| {
                corrupt(format!("truncated frame after height {}: {}", blocks.len(), e))
            })?;

            let block = decode_block(&frame).map_err(|e| corrupt(e.to_string()))?;
            let expected = blocks.len() as u64 + 1;
            if block.height != expected {
                return Err(corrupt(format!(
                    "height gap: expected {}, found {}",
                    expected, block.height
                )));
            }
            blocks.push(block);
        }

        Ok(blocks)
    }
}

fn corrupt(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("corrupt block log: {}", msg))
}
