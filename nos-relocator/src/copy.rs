//! Chunk copy operations

/// Order in which bytes are moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Lowest byte first; safe when the destination is below the source
    Forward,
    /// Highest byte first; safe when the destination is above the source
    Backward,
}

/// One staging-to-target move performed by the trampoline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOp {
    pub src: u64,
    pub dest: u64,
    pub len: u64,
    pub direction: Direction,
}

impl CopyOp {
    /// `None` when there is nothing to move
    pub fn new(src: u64, dest: u64, len: u64) -> Option<Self> {
        if len == 0 || src == dest {
            return None;
        }
        let direction = if dest < src { Direction::Forward } else { Direction::Backward };
        Some(Self { src, dest, len, direction })
    }

    /// Source, destination and count as loaded into the string registers
    ///
    /// Backward copies start from the last byte of each range.
    pub fn register_operands(&self) -> (u64, u64, u64) {
        match self.direction {
            Direction::Forward => (self.src, self.dest, self.len),
            Direction::Backward => {
                (self.src + (self.len - 1), self.dest + (self.len - 1), self.len)
            }
        }
    }

    /// Whether both ranges fit below `limit`
    pub fn fits_below(&self, limit: u64) -> bool {
        let end = |start: u64| start.checked_add(self.len).is_some_and(|end| end <= limit);
        end(self.src) && end(self.dest)
    }

    /// Perform the move on `memory`, indexed by physical address, one byte at
    /// a time in the chosen direction
    ///
    /// Returns `false` without touching `memory` if either range is out of
    /// bounds.
    pub fn replay(&self, memory: &mut [u8]) -> bool {
        if !self.fits_below(memory.len() as u64) {
            return false;
        }
        let (src, dest, len) = (self.src as usize, self.dest as usize, self.len as usize);
        match self.direction {
            Direction::Forward => {
                for i in 0..len {
                    memory[dest + i] = memory[src + i];
                }
            }
            Direction::Backward => {
                for i in (0..len).rev() {
                    memory[dest + i] = memory[src + i];
                }
            }
        }
        true
    }
}
