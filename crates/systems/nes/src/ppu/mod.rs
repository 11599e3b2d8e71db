//! NES PPU (Picture Processing Unit) implementation.
//!
//! Cycle-stepped model of the 2C02: every call to [`Ppu::step`] processes
//! one dot of the 341×262 frame and then advances the beam.
//!
//! ## Rendering Model
//!
//! - Background tiles are fetched on an 8-dot cadence (nametable,
//!   attribute, low plane, high plane) and written to the framebuffer a
//!   tile at a time.
//! - Sprites for the next line are evaluated on dots 257-320 and their
//!   pattern rows fetched on dots 321-336.
//! - Sprites are composited over each column once its background pixel is
//!   final.
//! - No scrolling, palette RAM or nametable mirroring: the framebuffer
//!   holds palette-RAM indices and VRAM is one flat 16 KiB array.
//!
//! ## Register Interface
//!
//! - **$2000 (PPUCTRL)**: NMI enable, sprite size, pattern tables, increment
//! - **$2001 (PPUMASK)**: background / sprite enable
//! - **$2002 (PPUSTATUS)**: VBlank, sprite 0 hit, sprite overflow
//! - **$2003 (OAMADDR)** / **$2004 (OAMDATA)**: OAM access
//! - **$2005 (PPUSCROLL)**: latched, not applied to rendering
//! - **$2006 (PPUADDR)** / **$2007 (PPUDATA)**: VRAM access with buffered reads

mod sprite;

pub use sprite::{
    Composite, SpriteRow, SpriteUnit, ATTR_BEHIND_BACKGROUND, ATTR_FLIP_HORIZONTAL,
    ATTR_FLIP_VERTICAL, MAX_SPRITES_PER_LINE,
};

use nesboy_core::logging::{log, LogCategory, LogLevel, LogSink};
use nesboy_core::types::Frame;
use std::cell::Cell;
use std::fmt;

pub const SCREEN_WIDTH: usize = 256;
pub const SCREEN_HEIGHT: usize = 240;
pub const FRAME_SIZE: usize = SCREEN_WIDTH * SCREEN_HEIGHT;

pub const CYCLES_PER_SCANLINE: u16 = 341;
pub const SCANLINES_PER_FRAME: u16 = 262;
pub const POST_RENDER_SCANLINE: u16 = 240;
pub const VBLANK_SCANLINE: u16 = 241;
pub const PRE_RENDER_SCANLINE: u16 = 261;

/// 14-bit PPU address space
pub const VRAM_SIZE: usize = 0x4000;
const PATTERN_TABLES_SIZE: usize = 0x2000;
const NAMETABLE_BASE: u16 = 0x2000;
const ATTRIBUTE_BASE: u16 = 0x23C0;

pub const CTRL_INCREMENT_32: u8 = 0x04;
pub const CTRL_SPRITE_TABLE: u8 = 0x08;
pub const CTRL_BACKGROUND_TABLE: u8 = 0x10;
pub const CTRL_SPRITE_16: u8 = 0x20;
pub const CTRL_NMI: u8 = 0x80;

pub const MASK_BACKGROUND: u8 = 0x08;
pub const MASK_SPRITES: u8 = 0x10;

pub const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
pub const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
pub const STATUS_VBLANK: u8 = 0x80;

/// Tile being assembled by the background fetch cadence.
#[derive(Debug, Clone, Copy, Default)]
struct BackgroundLatch {
    tile: u8,
    palette: u8,
    pattern_lo: u8,
    pattern_hi: u8,
}

/// NES PPU (Picture Processing Unit).
///
/// Register reads have side effects (status clears VBlank, data advances
/// the address), so the state they touch lives in `Cell`s and
/// [`Ppu::read_register`] takes `&self`.
pub struct Ppu {
    vram: Box<[u8; VRAM_SIZE]>,
    oam: [u8; 256],
    control: u8,
    mask: u8,
    status: Cell<u8>,
    oam_addr: u8,
    oam_data: u8,
    scroll_x: u8,
    scroll_y: u8,
    // Shared first/second write toggle for PPUSCROLL and PPUADDR
    write_latch: Cell<bool>,
    vram_addr: Cell<u16>,
    read_buffer: Cell<u8>,
    scanline: u16,
    cycle: u16,
    frame_complete: bool,
    frame_count: u64,
    nmi_pending: bool,
    framebuffer: Box<[u8; FRAME_SIZE]>,
    background: BackgroundLatch,
    // Columns [0, bg_ready_x) of the current line hold final background pixels
    bg_ready_x: u16,
    composited_x: u16,
    sprites: SpriteUnit,
}

impl fmt::Debug for Ppu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ppu")
            .field("control", &self.control)
            .field("mask", &self.mask)
            .field("status", &self.status.get())
            .field("oam_addr", &self.oam_addr)
            .field("vram_addr", &self.vram_addr.get())
            .field("scanline", &self.scanline)
            .field("cycle", &self.cycle)
            .field("frame_complete", &self.frame_complete)
            .field("frame_count", &self.frame_count)
            .field("sprites_found", &self.sprites.sprites_found())
            .finish_non_exhaustive()
    }
}

impl Ppu {
    /// Create a PPU whose pattern tables are seeded from `chr`
    /// (at most 8 KiB are used).
    pub fn new(chr: &[u8]) -> Self {
        let mut vram = Box::new([0u8; VRAM_SIZE]);
        let len = chr.len().min(PATTERN_TABLES_SIZE);
        vram[..len].copy_from_slice(&chr[..len]);

        Self {
            vram,
            // Y = 0xFF keeps every sprite off screen until the program fills OAM
            oam: [0xFF; 256],
            control: 0,
            mask: 0,
            status: Cell::new(0),
            oam_addr: 0,
            oam_data: 0,
            scroll_x: 0,
            scroll_y: 0,
            write_latch: Cell::new(false),
            vram_addr: Cell::new(0),
            read_buffer: Cell::new(0),
            scanline: 0,
            cycle: 0,
            frame_complete: false,
            frame_count: 0,
            nmi_pending: false,
            framebuffer: Box::new([0u8; FRAME_SIZE]),
            background: BackgroundLatch::default(),
            bg_ready_x: 0,
            composited_x: 0,
            sprites: SpriteUnit::default(),
        }
    }

    // --- register file -------------------------------------------------

    /// CPU read of register `reg & 7`.
    pub fn read_register(&self, reg: u16) -> u8 {
        match reg & 0x7 {
            0 => self.control,
            1 => self.mask,
            2 => {
                let status = self.status.get();
                self.status.set(status & !STATUS_VBLANK);
                self.write_latch.set(false);
                status
            }
            3 => self.oam_addr,
            4 => self.oam[self.oam_addr as usize],
            7 => {
                let buffered = self.read_buffer.get();
                self.read_buffer.set(self.read_vram(self.vram_addr.get()));
                self.increment_vram_addr();
                buffered
            }
            _ => 0,
        }
    }

    /// CPU write of register `reg & 7`.
    pub fn write_register(&mut self, reg: u16, val: u8, sink: &mut dyn LogSink) {
        match reg & 0x7 {
            0 => {
                let was_enabled = self.control & CTRL_NMI != 0;
                self.control = val;
                log(sink, LogCategory::Ppu, LogLevel::Trace, || {
                    format!("PPUCTRL write: 0x{:02X}", val)
                });
                if !was_enabled && val & CTRL_NMI != 0 && self.status.get() & STATUS_VBLANK != 0 {
                    self.raise_nmi(sink, "NMI enabled during VBlank");
                }
            }
            1 => self.mask = val,
            2 => log(sink, LogCategory::Ppu, LogLevel::Trace, || {
                format!("ignored write 0x{:02X} to PPUSTATUS", val)
            }),
            3 => self.oam_addr = val,
            4 => {
                self.oam[self.oam_addr as usize] = val;
                self.oam_data = val;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            5 => {
                if self.write_latch.get() {
                    self.scroll_y = val;
                } else {
                    self.scroll_x = val;
                }
                self.write_latch.set(!self.write_latch.get());
            }
            6 => {
                let addr = self.vram_addr.get();
                if self.write_latch.get() {
                    self.vram_addr.set((addr & 0xFF00) | val as u16);
                } else {
                    self.vram_addr.set((((val & 0x3F) as u16) << 8) | (addr & 0x00FF));
                }
                self.write_latch.set(!self.write_latch.get());
            }
            _ => {
                self.write_vram(self.vram_addr.get(), val);
                self.increment_vram_addr();
            }
        }
    }

    fn increment_vram_addr(&self) {
        let step = if self.control & CTRL_INCREMENT_32 != 0 { 32 } else { 1 };
        self.vram_addr.set(self.vram_addr.get().wrapping_add(step));
    }

    pub fn read_vram(&self, addr: u16) -> u8 {
        self.vram[(addr & 0x3FFF) as usize]
    }

    pub fn write_vram(&mut self, addr: u16, val: u8) {
        self.vram[(addr & 0x3FFF) as usize] = val;
    }

    fn raise_nmi(&mut self, sink: &mut dyn LogSink, reason: &str) {
        self.nmi_pending = true;
        log(sink, LogCategory::Interrupts, LogLevel::Debug, || {
            format!(
                "PPU NMI request ({}) at scanline {} cycle {}",
                reason, self.scanline, self.cycle
            )
        });
    }

    /// Consume a pending NMI request.
    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi_pending)
    }

    // --- timing --------------------------------------------------------

    /// Process the current dot, then advance the beam by one.
    pub fn step(&mut self, sink: &mut dyn LogSink) {
        if self.cycle == 0 {
            self.start_scanline();
        }

        match self.scanline {
            0..=239 => self.visible_dot(sink),
            POST_RENDER_SCANLINE => {}
            VBLANK_SCANLINE => {
                if self.cycle == 1 {
                    self.enter_vblank(sink);
                }
            }
            PRE_RENDER_SCANLINE => self.pre_render_dot(sink),
            _ => {}
        }

        self.cycle += 1;
        if self.cycle == CYCLES_PER_SCANLINE {
            self.cycle = 0;
            self.scanline += 1;
            if self.scanline == SCANLINES_PER_FRAME {
                self.scanline = 0;
                self.frame_complete = true;
                self.frame_count += 1;
                log(sink, LogCategory::Ppu, LogLevel::Trace, || {
                    format!("frame {} complete", self.frame_count)
                });
            }
        }
    }

    fn start_scanline(&mut self) {
        self.sprites.start_line();
        self.bg_ready_x = 0;
        self.composited_x = 0;
    }

    fn visible_dot(&mut self, sink: &mut dyn LogSink) {
        match self.cycle {
            1..=256 => {
                self.fetch_background(true);
                self.composite_ready_columns();
            }
            257..=320 => self.evaluate_sprite(sink),
            321..=336 => self.fetch_sprite_pattern(),
            _ => {}
        }
    }

    fn pre_render_dot(&mut self, sink: &mut dyn LogSink) {
        if self.cycle == 1 {
            let status = self.status.get();
            self.status
                .set(status & !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW));
            self.sprites.clear_flags();
        }
        match self.cycle {
            1..=256 => self.fetch_background(false),
            257..=320 => self.evaluate_sprite(sink),
            321..=336 => self.fetch_sprite_pattern(),
            _ => {}
        }
    }

    fn enter_vblank(&mut self, sink: &mut dyn LogSink) {
        self.status.set(self.status.get() | STATUS_VBLANK);
        log(sink, LogCategory::Ppu, LogLevel::Trace, || {
            format!("VBlank start, frame {}", self.frame_count)
        });
        if self.control & CTRL_NMI != 0 {
            self.raise_nmi(sink, "VBlank");
        }
    }

    // --- background ----------------------------------------------------

    fn fetch_background(&mut self, render: bool) {
        let dot = self.cycle - 1;
        let tile_x = dot / 8;
        let tile_y = self.scanline / 8;

        match dot % 8 {
            0 => {
                self.background.tile = self.read_vram(NAMETABLE_BASE + tile_y * 32 + tile_x);
            }
            2 => {
                let attr = self.read_vram(ATTRIBUTE_BASE + (tile_y / 4) * 8 + tile_x / 4);
                let quad_x = (tile_x % 4) / 2;
                let quad_y = (tile_y % 4) / 2;
                let shift = quad_y * 4 + quad_x * 2;
                self.background.palette = (attr >> shift) & 0x03;
            }
            4 => {
                let addr = self.background_row_address();
                self.background.pattern_lo = self.read_vram(addr);
            }
            6 => {
                let addr = self.background_row_address() + 8;
                self.background.pattern_hi = self.read_vram(addr);
                if render {
                    self.write_background_tile(tile_x);
                }
            }
            _ => {}
        }
    }

    fn background_row_address(&self) -> u16 {
        let table = if self.control & CTRL_BACKGROUND_TABLE != 0 {
            0x1000
        } else {
            0
        };
        table + self.background.tile as u16 * 16 + self.scanline % 8
    }

    fn write_background_tile(&mut self, tile_x: u16) {
        let row = self.scanline as usize * SCREEN_WIDTH;
        let enabled = self.mask & MASK_BACKGROUND != 0;
        let BackgroundLatch {
            palette,
            pattern_lo,
            pattern_hi,
            ..
        } = self.background;

        for px in 0..8u16 {
            let bit = 7 - px;
            let colour = (((pattern_hi >> bit) & 1) << 1) | ((pattern_lo >> bit) & 1);
            let value = if enabled && colour != 0 {
                palette * 4 + colour
            } else {
                0
            };
            self.framebuffer[row + (tile_x * 8 + px) as usize] = value;
        }
        self.bg_ready_x = (tile_x + 1) * 8;
    }

    // --- sprites -------------------------------------------------------

    fn sprite_height(&self) -> u16 {
        if self.control & CTRL_SPRITE_16 != 0 {
            16
        } else {
            8
        }
    }

    fn target_line(&self) -> u16 {
        (self.scanline + 1) % SCANLINES_PER_FRAME
    }

    fn evaluate_sprite(&mut self, sink: &mut dyn LogSink) {
        if self.cycle == 257 {
            self.sprites.begin_evaluation();
        }
        let index = (self.cycle - 257) as usize;
        let target = self.target_line();
        let height = self.sprite_height();
        if self.sprites.evaluate(&self.oam, index, target, height) {
            self.status.set(self.status.get() | STATUS_SPRITE_OVERFLOW);
            log(sink, LogCategory::Ppu, LogLevel::Debug, || {
                format!("sprite overflow on line {} (OAM sprite {})", target, index)
            });
        }
    }

    fn fetch_sprite_pattern(&mut self) {
        let offset = (self.cycle - 321) as usize;
        let slot = offset / 2;
        let high_plane = offset % 2 == 1;
        let sprite_table = if self.control & CTRL_SPRITE_TABLE != 0 {
            0x1000
        } else {
            0
        };
        if let Some(addr) = self.sprites.pattern_address(
            slot,
            high_plane,
            self.target_line(),
            self.sprite_height(),
            sprite_table,
        ) {
            let value = self.read_vram(addr);
            self.sprites.store_pattern(slot, high_plane, value);
        }
    }

    fn composite_ready_columns(&mut self) {
        let sprites_enabled = self.mask & MASK_SPRITES != 0;
        let row = self.scanline as usize * SCREEN_WIDTH;

        while self.composited_x < self.bg_ready_x {
            let x = self.composited_x;
            self.composited_x += 1;
            if !sprites_enabled {
                continue;
            }
            let idx = row + x as usize;
            let result = self.sprites.composite(x, self.framebuffer[idx]);
            if result.sprite_zero_hit {
                self.status.set(self.status.get() | STATUS_SPRITE_ZERO_HIT);
            }
            if let Some(pixel) = result.pixel {
                self.framebuffer[idx] = pixel;
            }
        }
    }

    // --- frame handshake and inspection ----------------------------------

    pub fn frame(&self) -> &[u8; FRAME_SIZE] {
        &self.framebuffer
    }

    pub fn is_frame_complete(&self) -> bool {
        self.frame_complete
    }

    pub fn reset_frame_complete(&mut self) {
        self.frame_complete = false;
    }

    pub fn to_frame(&self) -> Frame {
        Frame::from_pixels(SCREEN_WIDTH as u32, SCREEN_HEIGHT as u32, &self.framebuffer[..])
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn scanline(&self) -> u16 {
        self.scanline
    }

    pub fn cycle(&self) -> u16 {
        self.cycle
    }

    pub fn control(&self) -> u8 {
        self.control
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }

    /// Status register without the read side effects.
    pub fn status(&self) -> u8 {
        self.status.get()
    }

    pub fn oam_addr(&self) -> u8 {
        self.oam_addr
    }

    pub fn oam_data(&self) -> u8 {
        self.oam_data
    }

    pub fn scroll(&self) -> (u8, u8) {
        (self.scroll_x, self.scroll_y)
    }

    pub fn vram_addr(&self) -> u16 {
        self.vram_addr.get()
    }

    pub fn oam(&self) -> &[u8; 256] {
        &self.oam
    }

    pub fn oam_mut(&mut self) -> &mut [u8; 256] {
        &mut self.oam
    }

    pub fn sprites(&self) -> &SpriteUnit {
        &self.sprites
    }

    pub fn nmi_pending(&self) -> bool {
        self.nmi_pending
    }
}
