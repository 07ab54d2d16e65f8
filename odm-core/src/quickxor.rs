use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::AsyncReadExt;

const WIDTH_IN_BITS: usize = 160;
const SHIFT: usize = 11;
const CELLS: usize = (WIDTH_IN_BITS - 1) / 64 + 1;
const BITS_IN_LAST_CELL: usize = WIDTH_IN_BITS % 64;
const DIGEST_LEN: usize = WIDTH_IN_BITS / 8;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct QuickXorHash {
    cells: [u64; CELLS],
    shifted: usize,
    length: u64,
}

impl QuickXorHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut cell_index = self.shifted / 64;
        let mut cell_offset = self.shifted % 64;

        // Bytes 160 positions apart land on the same bit, so fold them first.
        for i in 0..data.len().min(WIDTH_IN_BITS) {
            let is_last = cell_index == CELLS - 1;
            let cell_bits = if is_last { BITS_IN_LAST_CELL } else { 64 };
            let next_cell = if is_last { 0 } else { cell_index + 1 };

            let folded = data[i..]
                .iter()
                .step_by(WIDTH_IN_BITS)
                .fold(0u8, |acc, byte| acc ^ byte);

            self.cells[cell_index] ^= u64::from(folded) << cell_offset;
            if cell_offset > cell_bits - 8 {
                self.cells[next_cell] ^= u64::from(folded) >> (cell_bits - cell_offset);
            }

            cell_offset += SHIFT;
            if cell_offset >= cell_bits {
                cell_index = next_cell;
                cell_offset -= cell_bits;
            }
        }

        self.shifted = (self.shifted + SHIFT * (data.len() % WIDTH_IN_BITS)) % WIDTH_IN_BITS;
        self.length += data.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn finalize_bytes(&self) -> [u8; DIGEST_LEN] {
        let mut out = [0u8; DIGEST_LEN];
        for (index, cell) in self.cells.iter().enumerate() {
            let start = index * 8;
            let end = (start + 8).min(DIGEST_LEN);
            out[start..end].copy_from_slice(&cell.to_le_bytes()[..end - start]);
        }

        let length = self.length.to_le_bytes();
        let tail = DIGEST_LEN - length.len();
        for (offset, byte) in length.iter().enumerate() {
            out[tail + offset] ^= byte;
        }
        out
    }

    pub fn finalize(&self) -> String {
        STANDARD.encode(self.finalize_bytes())
    }

    pub fn digest(data: &[u8]) -> String {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = QuickXorHash::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize())
}
