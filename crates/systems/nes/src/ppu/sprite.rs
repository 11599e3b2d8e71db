//! Per-scanline sprite pipeline: evaluation into secondary OAM, pattern
//! fetch for the next line, and per-column compositing over the background.

/// Hardware limit on sprites drawn per scanline.
pub const MAX_SPRITES_PER_LINE: usize = 8;
/// Bytes per OAM entry: Y, tile, attributes, X.
pub const OAM_ENTRY_SIZE: usize = 4;
pub const SECONDARY_OAM_SIZE: usize = MAX_SPRITES_PER_LINE * OAM_ENTRY_SIZE;

pub const ATTR_PALETTE: u8 = 0x03;
pub const ATTR_BEHIND_BACKGROUND: u8 = 0x20;
pub const ATTR_FLIP_HORIZONTAL: u8 = 0x40;
pub const ATTR_FLIP_VERTICAL: u8 = 0x80;

/// Sprite pixels live in the upper half of palette RAM.
const SPRITE_PALETTE_BASE: u8 = 0x10;

/// One sprite's pattern row for a scanline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpriteRow {
    pub x: u8,
    pub attr: u8,
    pub pattern_lo: u8,
    pub pattern_hi: u8,
}

impl SpriteRow {
    /// Colour (0-3) this row contributes at screen column `column`, or
    /// `None` when the column is outside the sprite.
    pub fn colour_at(&self, column: u16) -> Option<u8> {
        let left = self.x as u16;
        if column < left || column >= left + 8 {
            return None;
        }
        let offset = (column - left) as u8;
        let bit = if self.attr & ATTR_FLIP_HORIZONTAL != 0 {
            offset
        } else {
            7 - offset
        };
        let lo = (self.pattern_lo >> bit) & 1;
        let hi = (self.pattern_hi >> bit) & 1;
        Some((hi << 1) | lo)
    }
}

/// Result of compositing one column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Composite {
    /// Framebuffer value to write, if a sprite wins the column
    pub pixel: Option<u8>,
    pub sprite_zero_hit: bool,
}

#[derive(Debug, Clone)]
pub struct SpriteUnit {
    secondary_oam: [u8; SECONDARY_OAM_SIZE],
    sprites_found: usize,
    sprite_overflow: bool,
    sprite_zero_in_range: bool,
    /// Pattern rows fetched during cycles 321-336 for the next line
    fetched: [SpriteRow; MAX_SPRITES_PER_LINE],
    active: [SpriteRow; MAX_SPRITES_PER_LINE],
    active_count: usize,
    active_has_sprite_zero: bool,
}

impl Default for SpriteUnit {
    fn default() -> Self {
        Self {
            secondary_oam: [0xFF; SECONDARY_OAM_SIZE],
            sprites_found: 0,
            sprite_overflow: false,
            sprite_zero_in_range: false,
            fetched: [SpriteRow::default(); MAX_SPRITES_PER_LINE],
            active: [SpriteRow::default(); MAX_SPRITES_PER_LINE],
            active_count: 0,
            active_has_sprite_zero: false,
        }
    }
}

impl SpriteUnit {
    pub fn secondary_oam(&self) -> &[u8; SECONDARY_OAM_SIZE] {
        &self.secondary_oam
    }

    pub fn sprites_found(&self) -> usize {
        self.sprites_found
    }

    pub fn sprite_overflow(&self) -> bool {
        self.sprite_overflow
    }

    pub fn sprite_zero_in_range(&self) -> bool {
        self.sprite_zero_in_range
    }

    /// Sprites that will be composited on the current line.
    pub fn active(&self) -> &[SpriteRow] {
        &self.active[..self.active_count]
    }

    /// Pre-render line: drop the overflow and sprite-0 state of the last frame.
    pub fn clear_flags(&mut self) {
        self.sprite_overflow = false;
        self.sprite_zero_in_range = false;
    }

    /// Start of a new evaluation pass (cycle 257).
    pub fn begin_evaluation(&mut self) {
        self.secondary_oam = [0xFF; SECONDARY_OAM_SIZE];
        self.sprites_found = 0;
        self.sprite_zero_in_range = false;
    }

    /// Examine OAM sprite `index` against `target_line`. Returns true when
    /// this sprite is the one that overflowed the line.
    pub fn evaluate(&mut self, oam: &[u8; 256], index: usize, target_line: u16, height: u16) -> bool {
        let base = index * OAM_ENTRY_SIZE;
        let y = oam[base] as u16;
        if target_line < y || target_line >= y + height {
            return false;
        }

        if self.sprites_found < MAX_SPRITES_PER_LINE {
            let slot = self.sprites_found * OAM_ENTRY_SIZE;
            self.secondary_oam[slot..slot + OAM_ENTRY_SIZE]
                .copy_from_slice(&oam[base..base + OAM_ENTRY_SIZE]);
            if index == 0 {
                self.sprite_zero_in_range = true;
            }
            self.sprites_found += 1;
            false
        } else {
            let first = !self.sprite_overflow;
            self.sprite_overflow = true;
            first
        }
    }

    /// Pattern-table address of one plane of `slot`'s row on `target_line`.
    /// `None` for empty slots.
    pub fn pattern_address(
        &self,
        slot: usize,
        high_plane: bool,
        target_line: u16,
        height: u16,
        sprite_table: u16,
    ) -> Option<u16> {
        if slot >= self.sprites_found {
            return None;
        }
        let entry = &self.secondary_oam[slot * OAM_ENTRY_SIZE..(slot + 1) * OAM_ENTRY_SIZE];
        let (y, tile, attr) = (entry[0] as u16, entry[1] as u16, entry[2]);

        let mut row = target_line.saturating_sub(y).min(height - 1);
        if attr & ATTR_FLIP_VERTICAL != 0 {
            row = height - 1 - row;
        }

        let row_base = if height == 16 {
            let table = (tile & 1) * 0x1000;
            let top = tile & 0xFE;
            if row >= 8 {
                table + (top + 1) * 16 + (row - 8)
            } else {
                table + top * 16 + row
            }
        } else {
            sprite_table + tile * 16 + row
        };
        Some(if high_plane { row_base + 8 } else { row_base })
    }

    pub fn store_pattern(&mut self, slot: usize, high_plane: bool, value: u8) {
        let row = &mut self.fetched[slot];
        if high_plane {
            row.pattern_hi = value;
        } else {
            row.pattern_lo = value;
        }
    }

    /// Promote the evaluated sprites to the line that is starting.
    pub fn start_line(&mut self) {
        self.active_count = self.sprites_found;
        self.active_has_sprite_zero = self.sprite_zero_in_range;
        for slot in 0..self.active_count {
            let entry = &self.secondary_oam[slot * OAM_ENTRY_SIZE..(slot + 1) * OAM_ENTRY_SIZE];
            self.active[slot] = SpriteRow {
                x: entry[3],
                attr: entry[2],
                ..self.fetched[slot]
            };
        }
        self.fetched = [SpriteRow::default(); MAX_SPRITES_PER_LINE];
    }

    /// Resolve column `column` given its background pixel. Slots are scanned
    /// lowest OAM index first; the first opaque sprite allowed in front of
    /// the background wins.
    pub fn composite(&self, column: u16, background: u8) -> Composite {
        let mut result = Composite::default();
        for (slot, row) in self.active().iter().enumerate() {
            let colour = match row.colour_at(column) {
                Some(c) if c != 0 => c,
                _ => continue,
            };
            if slot == 0 && self.active_has_sprite_zero && background != 0 {
                result.sprite_zero_hit = true;
            }
            if row.attr & ATTR_BEHIND_BACKGROUND != 0 && background != 0 {
                continue;
            }
            result.pixel = Some(SPRITE_PALETTE_BASE + (row.attr & ATTR_PALETTE) * 4 + colour);
            break;
        }
        result
    }
}
