use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    terminal::{Clear, ClearType},
};
use olaview_core::{RenderImage, Surface};
use png::{BitDepth, ColorType, Encoder};
use tracing::debug;

/// Terminal region reserved for the page image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawArea {
    pub columns: u32,
    pub rows: u32,
    /// Cell size in pixels; zero when the terminal does not report it.
    pub cell_width: f32,
    pub cell_height: f32,
}

impl DrawArea {
    pub fn new(columns: u32, rows: u32, cell_width: f32, cell_height: f32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
            cell_width,
            cell_height,
        }
    }

    /// Cells covered by `image` when scaled to fit the area, aspect preserved.
    pub fn fit(&self, image: &RenderImage) -> (u32, u32) {
        if self.cell_width <= 0.0 || self.cell_height <= 0.0 || image.width == 0 || image.height == 0 {
            return (self.columns, self.rows);
        }
        let area_width = self.columns as f32 * self.cell_width;
        let area_height = self.rows as f32 * self.cell_height;
        let ratio = (area_width / image.width as f32).min(area_height / image.height as f32);
        let columns = (image.width as f32 * ratio / self.cell_width).floor() as u32;
        let rows = (image.height as f32 * ratio / self.cell_height).floor() as u32;
        (columns.clamp(1, self.columns), rows.clamp(1, self.rows))
    }
}

impl Default for DrawArea {
    fn default() -> Self {
        Self::new(80, 24, 0.0, 0.0)
    }
}

/// Presents pages through the kitty graphics protocol.
pub struct KittySurface<W: Write> {
    writer: W,
    image_id: u32,
    area: DrawArea,
    last_page: Option<usize>,
}

impl<W: Write> KittySurface<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            area: DrawArea::default(),
            last_page: None,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn set_area(&mut self, area: DrawArea) {
        self.area = area;
    }

    pub fn last_page(&self) -> Option<usize> {
        self.last_page
    }

    fn draw(&mut self, image: &RenderImage) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut png = encoder.write_header()?;
        png.write_image_data(&image.pixels)?;
        png.finish()?;

        let (columns, rows) = self.area.fit(image);
        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;

        crossterm::queue!(self.writer, cursor::MoveTo(0, 0))?;
        while let Some(chunk) = chunks.next() {
            let more = u8::from(chunks.peek().is_some());
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},c={},r={},z=-1,m={}",
                    self.image_id, columns, rows, more
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", more)?;
            }
            self.writer.write_all(b";")?;
            self.writer.write_all(chunk)?;
            write!(self.writer, "\u{1b}\\")?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> Surface for KittySurface<W> {
    fn clear(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=I,i={},q=2\u{1b}\\", self.image_id)?;
        self.writer.flush()?;
        self.last_page = None;
        Ok(())
    }

    fn present(&mut self, page: usize, image: &RenderImage) -> Result<()> {
        self.draw(image)?;
        debug!(page, width = image.width, height = image.height, "kitty image placed");
        self.last_page = Some(page);
        Ok(())
    }
}

/// Erases the screen and homes the cursor.
pub fn clear_screen<W: Write>(writer: &mut W) -> io::Result<()> {
    crossterm::execute!(writer, Clear(ClearType::All), cursor::MoveTo(0, 0))
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    PreviousPage,
    NextPage,
    FirstPage,
    LastPage,
    /// The page field gained focus; `text` is its new content.
    BeginPageEntry { text: String },
    PageEntryChanged { text: String },
    PageEntryCommit,
    /// The page field lost focus without committing.
    PageEntryBlur,
    OpenLayers,
    CloseLayers,
    LayerMoveSelection { delta: isize },
    LayerToggle,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    PageEntry,
    Layers,
}

#[derive(Debug, Default)]
pub struct EventMapper {
    mode: InputMode,
    entry: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.entry.clear();
            self.mode = mode;
        }
    }

    /// Text typed into the page field, while it has focus.
    pub fn pending_input(&self) -> Option<&str> {
        matches!(self.mode, InputMode::PageEntry).then_some(self.entry.as_str())
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match self.mode {
            InputMode::Normal => self.map_normal(code, modifiers),
            InputMode::PageEntry => self.map_page_entry(code, modifiers),
            InputMode::Layers => self.map_layers(code, modifiers),
        }
    }

    fn map_normal(&mut self, code: KeyCode, modifiers: KeyModifiers) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                self.set_mode(InputMode::PageEntry);
                self.entry.push(c);
                UiEvent::BeginPageEntry {
                    text: self.entry.clone(),
                }
            }
            (KeyCode::Char(':'), _) => {
                self.set_mode(InputMode::PageEntry);
                UiEvent::BeginPageEntry {
                    text: String::new(),
                }
            }
            (KeyCode::Char('j'), KeyModifiers::NONE)
            | (KeyCode::Down, KeyModifiers::NONE)
            | (KeyCode::Right, KeyModifiers::NONE)
            | (KeyCode::PageDown, _)
            | (KeyCode::Char(' '), KeyModifiers::NONE) => UiEvent::NextPage,
            (KeyCode::Char('k'), KeyModifiers::NONE)
            | (KeyCode::Up, KeyModifiers::NONE)
            | (KeyCode::Left, KeyModifiers::NONE)
            | (KeyCode::PageUp, _)
            | (KeyCode::Backspace, _) => UiEvent::PreviousPage,
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => UiEvent::FirstPage,
            (KeyCode::Char('G'), KeyModifiers::SHIFT)
            | (KeyCode::Char('G'), KeyModifiers::NONE)
            | (KeyCode::End, _) => UiEvent::LastPage,
            (KeyCode::Char('l'), KeyModifiers::NONE) | (KeyCode::Char('L'), _) => {
                self.set_mode(InputMode::Layers);
                UiEvent::OpenLayers
            }
            (KeyCode::Char('q'), _) => UiEvent::Quit,
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                UiEvent::Quit
            }
            _ => UiEvent::None,
        }
    }

    fn map_page_entry(&mut self, code: KeyCode, modifiers: KeyModifiers) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Enter, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::PageEntryCommit
            }
            (KeyCode::Esc, _) | (KeyCode::Tab, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::PageEntryBlur
            }
            (KeyCode::Backspace, _) => {
                self.entry.pop();
                UiEvent::PageEntryChanged {
                    text: self.entry.clone(),
                }
            }
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                self.set_mode(InputMode::Normal);
                UiEvent::Quit
            }
            (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                self.entry.push(c);
                UiEvent::PageEntryChanged {
                    text: self.entry.clone(),
                }
            }
            _ => UiEvent::None,
        }
    }

    fn map_layers(&mut self, code: KeyCode, modifiers: KeyModifiers) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Esc, _) | (KeyCode::Char('l'), _) | (KeyCode::Char('L'), _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::CloseLayers
            }
            (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, KeyModifiers::NONE) => {
                UiEvent::LayerMoveSelection { delta: 1 }
            }
            (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                UiEvent::LayerMoveSelection { delta: -1 }
            }
            (KeyCode::Enter, _) | (KeyCode::Char(' '), _) => UiEvent::LayerToggle,
            (KeyCode::Char('q'), _) => UiEvent::Quit,
            _ => UiEvent::None,
        }
    }
}
