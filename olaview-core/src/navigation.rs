use tokio::sync::watch;
use tracing::debug;

use crate::config::NavigationConfig;
use crate::render::{clamp_page, RenderFuture, RenderSession, ViewState};

/// Turns user intents into render requests.
///
/// Every operation returns the started render, or `None` when the intent was
/// a no-op. The caller decides whether to await or spawn it.
pub struct NavigationController {
    session: RenderSession,
    config: NavigationConfig,
    views: watch::Receiver<ViewState>,
    page_text: String,
    synced_page: usize,
}

impl NavigationController {
    pub fn new(session: RenderSession, config: NavigationConfig) -> Self {
        let mut views = session.subscribe();
        let synced_page = views.borrow_and_update().current_page;
        Self {
            session,
            config,
            views,
            page_text: synced_page.to_string(),
            synced_page,
        }
    }

    pub fn previous(&mut self) -> Option<RenderFuture> {
        self.step(-1)
    }

    pub fn next(&mut self) -> Option<RenderFuture> {
        self.step(1)
    }

    fn step(&mut self, delta: isize) -> Option<RenderFuture> {
        let view = self.session.view();
        if view.total_pages == 0 {
            return None;
        }
        let origin = match view.rendering_page {
            Some(page) if self.config.step_while_rendering => page,
            Some(_) => return None,
            None => view.current_page,
        };
        let target = origin.checked_add_signed(delta)?;
        if target < 1 || target > view.total_pages {
            return None;
        }
        Some(self.session.render_page(target))
    }

    /// Navigates to `page`, clamped into the document's range.
    pub fn go_to(&mut self, page: i64) -> Option<RenderFuture> {
        let view = self.session.view();
        if view.total_pages == 0 {
            return None;
        }
        let requested = usize::try_from(page.max(0)).unwrap_or(usize::MAX);
        let target = clamp_page(requested, view.total_pages);
        let heading = view.rendering_page.unwrap_or(view.current_page);
        if target == heading {
            return None;
        }
        Some(self.session.render_page(target))
    }

    /// Stores the raw field contents; nothing is validated until commit.
    pub fn on_text_input(&mut self, raw: &str) {
        self.observe();
        self.page_text = raw.to_string();
    }

    pub fn on_text_commit(&mut self) -> Option<RenderFuture> {
        match parse_page_number(&self.page_text) {
            Some(page) => {
                let render = self.go_to(page);
                if render.is_none() {
                    self.resync();
                }
                render
            }
            None => {
                debug!(text = %self.page_text, "rejecting page entry");
                self.resync();
                None
            }
        }
    }

    pub fn on_text_blur(&mut self) {
        self.resync();
    }

    /// Text for the page field. Follows the displayed page whenever it changes.
    pub fn page_text(&mut self) -> &str {
        self.observe();
        &self.page_text
    }

    pub fn can_go_previous(&self) -> bool {
        let view = self.session.view();
        self.step_allowed(&view) && view.current_page > 1
    }

    pub fn can_go_next(&self) -> bool {
        let view = self.session.view();
        self.step_allowed(&view) && view.current_page < view.total_pages
    }

    fn step_allowed(&self, view: &ViewState) -> bool {
        !view.is_rendering || self.config.step_while_rendering
    }

    pub fn session(&self) -> &RenderSession {
        &self.session
    }

    fn observe(&mut self) {
        if !self.views.has_changed().unwrap_or(false) {
            return;
        }
        let page = self.views.borrow_and_update().current_page;
        if page != self.synced_page {
            self.synced_page = page;
            self.page_text = page.to_string();
        }
    }

    fn resync(&mut self) {
        let page = self.session.current_page();
        self.synced_page = page;
        self.page_text = page.to_string();
    }
}

/// Reads a page number the way a numeric text field does: leading
/// whitespace and sign are accepted, parsing stops at the first non-digit.
pub fn parse_page_number(raw: &str) -> Option<i64> {
    let trimmed = raw.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let value = digits[..end].parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -value } else { value })
}
