//! Sector arithmetic for reward placement.
//!
//! A file is split into sectors of `sector_chunk_capacity` slots, one of which
//! is reserved for a buried reward. Logical indices are the client's
//! contiguous chunk numbering; physical indices include the reward slots.

use crate::error::{PearlError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One chunk unit in bytes.
pub const CHUNK_SIZE_BYTES: u64 = 1_000;

/// Number of chunk slots in one sector, reward slot included.
pub const SECTOR_CHUNK_CAPACITY: u64 = 1_000_000;

/// Delimiter used when a position list is persisted as text.
pub const POSITION_DELIMITER: &str = "_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorLayout {
    pub chunk_size_bytes: u64,
    pub sector_chunk_capacity: u64,
}

impl Default for SectorLayout {
    fn default() -> Self {
        Self {
            chunk_size_bytes: CHUNK_SIZE_BYTES,
            sector_chunk_capacity: SECTOR_CHUNK_CAPACITY,
        }
    }
}

impl SectorLayout {
    pub fn new(chunk_size_bytes: u64, sector_chunk_capacity: u64) -> Result<Self> {
        if chunk_size_bytes == 0 {
            return Err(PearlError::Config(
                "chunk_size_bytes must be positive".to_string(),
            ));
        }
        if sector_chunk_capacity < 3 {
            return Err(PearlError::Config(format!(
                "sector_chunk_capacity must be at least 3, got {}",
                sector_chunk_capacity
            )));
        }

        Ok(Self {
            chunk_size_bytes,
            sector_chunk_capacity,
        })
    }

    fn data_slots_per_sector(&self) -> u64 {
        self.sector_chunk_capacity - 1
    }

    /// Number of data chunks needed for `file_size_bytes`.
    pub fn chunk_count(&self, file_size_bytes: i64) -> u64 {
        if file_size_bytes <= 0 {
            return 0;
        }
        (file_size_bytes as u64).div_ceil(self.chunk_size_bytes)
    }

    pub fn sector_count(&self, file_size_bytes: i64) -> u64 {
        if file_size_bytes <= 0 {
            return 0;
        }
        let sector_bytes = self.chunk_size_bytes * self.data_slots_per_sector();
        (file_size_bytes as u64).div_ceil(sector_bytes)
    }

    pub fn sectors_for_chunks(&self, chunk_count: u64) -> u64 {
        chunk_count.div_ceil(self.data_slots_per_sector())
    }

    /// Total physical slots: data chunks plus one reward slot per sector.
    pub fn total_slots(&self, chunk_count: u64) -> u64 {
        chunk_count + self.sectors_for_chunks(chunk_count)
    }

    /// Draws one random burial position per sector.
    pub fn candidate_positions(&self, file_size_bytes: i64) -> Vec<u64> {
        self.candidate_positions_with(file_size_bytes, &mut rand::thread_rng())
    }

    pub fn candidate_positions_with<R: Rng + ?Sized>(
        &self,
        file_size_bytes: i64,
        rng: &mut R,
    ) -> Vec<u64> {
        let sectors = self.sector_count(file_size_bytes);
        if sectors == 0 {
            return Vec::new();
        }

        // the last sector only spans what is left of the file
        let mut remaining = self.chunk_count(file_size_bytes) + sectors;
        let mut positions = Vec::with_capacity(sectors as usize);
        for _ in 0..sectors {
            let range = remaining.min(self.sector_chunk_capacity);
            positions.push(rng.gen_range(0..range));
            remaining = remaining.saturating_sub(self.sector_chunk_capacity);
        }

        positions
    }

    /// Maps a client-visible chunk index to its storage slot.
    pub fn to_physical_index(&self, logical_index: u64, merged: &[u64]) -> u64 {
        if merged.is_empty() {
            return logical_index;
        }

        let sector = self.sector_of(logical_index, merged.len() as u64);
        let offset = logical_index as i64 - (sector * self.sector_chunk_capacity) as i64;
        if offset < merged[sector as usize] as i64 {
            logical_index + sector
        } else {
            logical_index + 1 + sector
        }
    }

    /// Physical slot left free in each sector by [`Self::to_physical_index`].
    pub fn reward_slots(&self, chunk_count: u64, merged: &[u64]) -> Result<Vec<u64>> {
        let sectors = merged.len() as u64;
        if sectors == 0 {
            return Ok(Vec::new());
        }
        if chunk_count == 0 || self.sectors_for_chunks(chunk_count) != sectors {
            return Err(PearlError::InvalidInput(format!(
                "{} positions do not cover {} chunks",
                sectors, chunk_count
            )));
        }

        let mut slots = Vec::with_capacity(merged.len());
        for (sector, &position) in merged.iter().enumerate() {
            let sector = sector as u64;
            let first = self.first_logical_in_sector(sector);
            let last = if sector + 1 == sectors {
                chunk_count - 1
            } else {
                self.first_logical_in_sector(sector + 1) - 1
            };
            let count = (last - first + 1) as i64;
            let first_offset = first as i64 - (sector * self.sector_chunk_capacity) as i64;
            let below = (position as i64 - first_offset).clamp(0, count) as u64;
            slots.push(first + sector + below);
        }

        Ok(slots)
    }

    // Sectors past the last merged position fold into the last one; that only
    // happens for the final chunk when the chunk count fills its sectors exactly.
    fn sector_of(&self, logical_index: u64, sectors: u64) -> u64 {
        ((logical_index + 1) / self.data_slots_per_sector()).min(sectors - 1)
    }

    fn first_logical_in_sector(&self, sector: u64) -> u64 {
        if sector == 0 {
            0
        } else {
            sector * self.data_slots_per_sector() - 1
        }
    }
}

/// Combines both brokers' candidates so neither decides a position alone.
pub fn merge_positions(a: &[u64], b: &[u64]) -> Result<Vec<u64>> {
    if (a.is_empty() && b.is_empty()) || a.len() != b.len() {
        return Err(PearlError::InvalidInput(format!(
            "cannot merge positions of length {} and {}",
            a.len(),
            b.len()
        )));
    }

    Ok(a.iter().zip(b).map(|(x, y)| (x + y) / 2).collect())
}

pub fn join_positions(positions: &[u64], delimiter: &str) -> String {
    positions
        .iter()
        .map(|position| position.to_string())
        .collect::<Vec<_>>()
        .join(delimiter)
}

/// Lenient split: fields that are not integers are skipped.
pub fn split_positions(value: &str, delimiter: &str) -> Vec<u64> {
    if value.is_empty() {
        return Vec::new();
    }

    value
        .split(delimiter)
        .filter_map(|field| field.parse::<u64>().ok())
        .collect()
}

/// Strict parse of a persisted placement map.
pub fn parse_placement_map(value: &str) -> Result<Vec<u64>> {
    if value.is_empty() {
        return Ok(Vec::new());
    }

    value
        .split(POSITION_DELIMITER)
        .map(|field| {
            field.parse::<u64>().map_err(|_| {
                PearlError::InvalidInput(format!("malformed placement map field '{}'", field))
            })
        })
        .collect()
}
