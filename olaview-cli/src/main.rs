use std::fs;
use std::io::{self, Stdout, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, Event};
use crossterm::style::{Attribute, Print, SetAttribute};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use olaview_core::{
    DocumentSession, LayerGroup, LayerVisibility, LoadOutcome, NavigationController,
    RasterBackend, RenderFuture, RenderOutcome, SessionEvent, SharedSurface, SourceId,
    ViewerConfig,
};
use olaview_render::PdfEngine;
use olaview_tty::{
    clear_screen, write_status_line, DrawArea, EventMapper, InputMode, KittySurface, UiEvent,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const PANEL_WIDTH: u16 = 36;

#[derive(Debug, Parser)]
#[command(
    name = "olaview",
    version,
    about = "kitty-native PDF viewer with optional content layers"
)]
struct Args {
    /// Page to open the document on (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<i64>,

    /// Configuration file (defaults to config.toml in the platform config directory)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// PDF file to open
    file: PathBuf,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

type Screen = Arc<Mutex<KittySurface<Stdout>>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "olaview", "olaview")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let config = ViewerConfig::load(&config_path)?;
    debug!(?config, path = %config_path.display(), "configuration loaded");

    let engine = Arc::new(PdfEngine::new()?);
    let screen: Screen = Arc::new(Mutex::new(KittySurface::new(io::stdout())));
    let surface: SharedSurface = screen.clone();
    let backend = Arc::new(RasterBackend::new(surface));
    let mut session = DocumentSession::new(engine, backend, &config);
    let mut navigator = session.navigator();

    let _raw = RawModeGuard::new()?;
    {
        let mut screen = screen.lock();
        let writer = screen.writer();
        crossterm::execute!(writer, cursor::Hide)?;
        clear_screen(writer)?;
        screen.set_area(draw_area()?);
    }

    let source = SourceId::from(args.file.as_path());
    match session
        .load(source)
        .await
        .with_context(|| format!("failed to open {:?}", args.file))?
    {
        LoadOutcome::Loaded(report) => {
            if let Some(Err(err)) = report.first_render {
                warn!(error = %err, "first page could not be rendered");
            }
        }
        LoadOutcome::Unchanged => {}
    }
    if let Some(page) = args.page {
        spawn_render(navigator.go_to(page));
    }

    let mut views = session.render_session().subscribe();
    let mut mapper = EventMapper::new();
    let mut panel = LayerPanel::default();
    let mut status = StatusLine::new(&args.file);
    let mut dirty = true;

    loop {
        if views.has_changed().unwrap_or(false) {
            let _ = views.borrow_and_update();
            dirty = true;
        }
        if status.absorb(session.take_events()) {
            dirty = true;
        }

        if dirty {
            redraw(&screen, &session, &mut navigator, &mapper, &panel, &status)?;
            dirty = false;
        }

        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let ev = event::read()?;
        if let Event::Resize(..) = ev {
            screen.lock().set_area(draw_area()?);
            let render = session.render_session();
            if render.total_pages() > 0 {
                spawn_render(Some(render.render_page(render.current_page())));
            }
            dirty = true;
            continue;
        }

        let ui_event = mapper.map_event(ev);
        match handle_event(ui_event, &session, &mut navigator, &mut panel)? {
            LoopAction::ContinueRedraw => dirty = true,
            LoopAction::Continue => {}
            LoopAction::Quit => break,
        }
        if mapper.mode() != InputMode::Layers && panel.open {
            panel.open = false;
            clear_panel(&screen)?;
            dirty = true;
        }
    }

    session.close();
    let mut screen = screen.lock();
    clear_screen(screen.writer())?;
    Ok(())
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

fn handle_event(
    event: UiEvent,
    session: &DocumentSession,
    navigator: &mut NavigationController,
    panel: &mut LayerPanel,
) -> Result<LoopAction> {
    match event {
        UiEvent::NextPage => spawn_render(navigator.next()),
        UiEvent::PreviousPage => spawn_render(navigator.previous()),
        UiEvent::FirstPage => spawn_render(navigator.go_to(1)),
        UiEvent::LastPage => spawn_render(navigator.go_to(i64::MAX)),
        UiEvent::BeginPageEntry { text } | UiEvent::PageEntryChanged { text } => {
            navigator.on_text_input(&text)
        }
        UiEvent::PageEntryCommit => spawn_render(navigator.on_text_commit()),
        UiEvent::PageEntryBlur => navigator.on_text_blur(),
        UiEvent::OpenLayers => {
            panel.open = true;
            panel.clamp(session.layer_groups());
        }
        // The main loop notices the mode change and wipes the panel.
        UiEvent::CloseLayers => {}
        UiEvent::LayerMoveSelection { delta } => panel.move_selection(delta, session.layer_groups()),
        UiEvent::LayerToggle => {
            if let Some(id) = panel.selected_id(session.layer_groups()) {
                let visible = session.layer_visibility().get(&id).unwrap_or(true);
                match session.render_session().set_layer_visibility(&id, !visible) {
                    Ok(render) => spawn_render(Some(render)),
                    Err(err) => warn!(error = %err, layer = %id, "layer toggle rejected"),
                }
            }
        }
        UiEvent::Quit => return Ok(LoopAction::Quit),
        UiEvent::None => return Ok(LoopAction::Continue),
    }
    Ok(LoopAction::ContinueRedraw)
}

fn spawn_render(render: Option<RenderFuture>) {
    let Some(render) = render else {
        return;
    };
    tokio::spawn(async move {
        match render.await {
            Ok(RenderOutcome::Rendered { page }) => debug!(page, "render finished"),
            Ok(RenderOutcome::Superseded { page }) => debug!(page, "render superseded"),
            Err(err) => warn!(error = %err, "render failed"),
        }
    });
}

/// Cursor into the flattened member list of the layer groups.
#[derive(Debug, Default)]
struct LayerPanel {
    open: bool,
    selected: usize,
}

impl LayerPanel {
    fn entries(groups: &[LayerGroup]) -> usize {
        groups.iter().map(|group| group.members.len()).sum()
    }

    fn clamp(&mut self, groups: &[LayerGroup]) {
        self.selected = self.selected.min(Self::entries(groups).saturating_sub(1));
    }

    fn move_selection(&mut self, delta: isize, groups: &[LayerGroup]) {
        let total = Self::entries(groups);
        if total == 0 {
            return;
        }
        self.selected = self
            .selected
            .saturating_add_signed(delta)
            .min(total - 1);
    }

    fn selected_id(&self, groups: &[LayerGroup]) -> Option<String> {
        groups
            .iter()
            .flat_map(|group| group.members.iter())
            .nth(self.selected)
            .map(|entry| entry.id.clone())
    }

    fn lines(&self, groups: &[LayerGroup], visibility: &LayerVisibility) -> Vec<(String, bool)> {
        let mut lines = Vec::new();
        let mut index = 0;
        for group in groups {
            lines.push((format!(" {}", group.title), true));
            for entry in &group.members {
                let marker = if index == self.selected { '>' } else { ' ' };
                let check = if visibility.get(&entry.id).unwrap_or(true) { 'x' } else { ' ' };
                lines.push((format!("{marker} [{check}] {}", entry.label), false));
                index += 1;
            }
        }
        if lines.is_empty() {
            lines.push((" no layers".to_string(), false));
        }
        lines
    }
}

struct StatusLine {
    name: String,
    last_error: Option<String>,
}

impl StatusLine {
    fn new(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            last_error: None,
        }
    }

    /// Returns true when the line changed.
    fn absorb(&mut self, events: Vec<SessionEvent>) -> bool {
        let mut changed = false;
        for event in events {
            info!(?event, "session event");
            match event {
                SessionEvent::RenderFailed { page, message } => {
                    self.last_error = Some(format!("page {page}: {message}"));
                    changed = true;
                }
                SessionEvent::LoadFailed { message, .. } => {
                    self.last_error = Some(message);
                    changed = true;
                }
                SessionEvent::PageRendered { .. } | SessionEvent::DocumentLoaded { .. } => {
                    changed |= self.last_error.take().is_some();
                }
                SessionEvent::DocumentClosed { .. } => {}
            }
        }
        changed
    }

    fn format(&self, navigator: &mut NavigationController, editing: bool) -> String {
        let view = navigator.session().view();
        let text = navigator.page_text();
        let page = if editing {
            format!("[{text}_]")
        } else {
            format!("[{text}]")
        };
        let mut status = format!("{}  page {} / {}", self.name, page, view.total_pages);
        if let Some(target) = view.rendering_page {
            status.push_str(&format!("  rendering {target}…"));
        }
        if let Some(err) = &self.last_error {
            status.push_str(&format!("  ! {err}"));
        }
        status
    }
}

fn draw_area() -> Result<DrawArea> {
    let window = terminal::window_size()?;
    let columns = u32::from(window.columns).max(1);
    let rows = u32::from(window.rows).max(1);
    let cell_width = f32::from(window.width) / columns as f32;
    let cell_height = f32::from(window.height) / rows as f32;
    Ok(DrawArea::new(
        columns,
        rows.saturating_sub(1),
        cell_width,
        cell_height,
    ))
}

fn redraw(
    screen: &Screen,
    session: &DocumentSession,
    navigator: &mut NavigationController,
    mapper: &EventMapper,
    panel: &LayerPanel,
    status: &StatusLine,
) -> Result<()> {
    let line = status.format(navigator, mapper.mode() == InputMode::PageEntry);
    let (total_cols, total_rows) = terminal::size()?;
    let mut screen = screen.lock();
    let writer = screen.writer();

    if panel.open {
        let left = total_cols.saturating_sub(PANEL_WIDTH);
        let width = usize::from(total_cols - left);
        let lines = panel.lines(session.layer_groups(), &session.layer_visibility());
        for (row, (text, heading)) in lines
            .iter()
            .take(usize::from(total_rows.saturating_sub(1)))
            .enumerate()
        {
            let content = format!("{:<width$}", truncate(text, width), width = width);
            crossterm::queue!(writer, cursor::MoveTo(left, row as u16))?;
            if *heading {
                crossterm::queue!(
                    writer,
                    SetAttribute(Attribute::Reverse),
                    Print(content),
                    SetAttribute(Attribute::Reset)
                )?;
            } else {
                crossterm::queue!(writer, Print(content))?;
            }
        }
    }

    crossterm::queue!(
        writer,
        cursor::MoveTo(0, total_rows.saturating_sub(1)),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(writer, &truncate(&line, usize::from(total_cols)))?;
    Ok(())
}

fn clear_panel(screen: &Screen) -> Result<()> {
    let (total_cols, total_rows) = terminal::size()?;
    let left = total_cols.saturating_sub(PANEL_WIDTH);
    let blank = " ".repeat(usize::from(total_cols - left));
    let mut screen = screen.lock();
    let writer = screen.writer();
    for row in 0..total_rows.saturating_sub(1) {
        crossterm::queue!(writer, cursor::MoveTo(left, row), Print(&blank))?;
    }
    writer.flush()?;
    Ok(())
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(width.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "olaview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The terminal is in raw mode and owned by the image surface, so logs go
    // to the file only.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
