//! The render session: one authoritative current page, at most one live
//! render, and the cancel-then-render protocol that keeps them consistent.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::backend::{DocumentHandle, DrawingBackend, RenderTask, VisibilitySnapshot};
use crate::config::RenderConfig;
use crate::error::{RenderError, SessionError, SessionResult};
use crate::layers::LayerVisibility;
use crate::{EventLog, SessionEvent};

pub type RenderFuture =
    Pin<Box<dyn Future<Output = SessionResult<RenderOutcome>> + Send + 'static>>;

/// Identity of one `render_page` call. Completions compare their ticket with
/// the recorded active one before touching state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered { page: usize },
    /// A newer render replaced this one; nothing was changed.
    Superseded { page: usize },
}

/// What the host sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewState {
    pub current_page: usize,
    pub total_pages: usize,
    pub is_rendering: bool,
    pub rendering_page: Option<usize>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            current_page: 1,
            total_pages: 0,
            is_rendering: false,
            rendering_page: None,
        }
    }
}

struct ActiveRender {
    ticket: RenderTicket,
    page: usize,
    task: Option<Arc<dyn RenderTask>>,
}

struct RenderState {
    document: Option<Arc<dyn DocumentHandle>>,
    page_count: usize,
    current_page: usize,
    active: Option<ActiveRender>,
    /// Task that painted the page currently on the surface.
    displayed: Option<Arc<dyn RenderTask>>,
    visibility: LayerVisibility,
}

impl RenderState {
    fn empty() -> Self {
        Self {
            document: None,
            page_count: 0,
            current_page: 1,
            active: None,
            displayed: None,
            visibility: LayerVisibility::default(),
        }
    }

    fn is_active(&self, ticket: RenderTicket) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.ticket == ticket)
    }

    fn take_tasks(&mut self) -> Vec<Arc<dyn RenderTask>> {
        let active = self.active.take().and_then(|active| active.task);
        active.into_iter().chain(self.displayed.take()).collect()
    }

    fn view(&self) -> ViewState {
        ViewState {
            current_page: self.current_page,
            total_pages: self.page_count,
            is_rendering: self.active.is_some(),
            rendering_page: self.active.as_ref().map(|active| active.page),
        }
    }
}

fn release(tasks: Vec<Arc<dyn RenderTask>>) {
    for task in tasks {
        task.cancel();
        task.dispose();
    }
}

pub fn clamp_page(requested: usize, page_count: usize) -> usize {
    requested.clamp(1, page_count.max(1))
}

struct Inner {
    backend: Arc<dyn DrawingBackend>,
    scale: f32,
    tickets: AtomicU64,
    state: Mutex<RenderState>,
    view_tx: watch::Sender<ViewState>,
    events: EventLog,
}

#[derive(Clone)]
pub struct RenderSession {
    inner: Arc<Inner>,
}

impl RenderSession {
    pub fn new(backend: Arc<dyn DrawingBackend>, config: RenderConfig, events: EventLog) -> Self {
        let (view_tx, _) = watch::channel(ViewState::default());
        Self {
            inner: Arc::new(Inner {
                backend,
                scale: config.effective_scale(),
                tickets: AtomicU64::new(0),
                state: Mutex::new(RenderState::empty()),
                view_tx,
                events,
            }),
        }
    }

    /// Replaces the whole render state with a fresh one for `document`.
    pub fn attach(&self, document: Arc<dyn DocumentHandle>, visibility: LayerVisibility) {
        let stale = {
            let mut state = self.inner.state.lock();
            let stale = state.take_tasks();
            *state = RenderState {
                page_count: document.page_count(),
                document: Some(document),
                visibility,
                ..RenderState::empty()
            };
            stale
        };
        release(stale);
        self.publish();
    }

    /// Cancels any render and drops back to the empty state.
    pub fn detach(&self) {
        let stale = {
            let mut state = self.inner.state.lock();
            let stale = state.take_tasks();
            *state = RenderState::empty();
            stale
        };
        release(stale);
        self.inner.backend.clear_surface();
        self.publish();
    }

    /// Starts rendering `requested` (clamped into the document's page range).
    ///
    /// Cancelling the previous render, recording the new one and clearing the
    /// surface happen before this returns; the returned future fetches, paints
    /// and settles the state.
    pub fn render_page(&self, requested: usize) -> RenderFuture {
        let ticket = RenderTicket(self.inner.tickets.fetch_add(1, Ordering::Relaxed) + 1);

        let (document, page, stale) = {
            let mut state = self.inner.state.lock();
            let document = match state.document.clone() {
                Some(document) if state.page_count > 0 => document,
                _ => return Box::pin(std::future::ready(Err(SessionError::NoDocument))),
            };
            let page = clamp_page(requested, state.page_count);
            let stale = state.take_tasks();
            state.active = Some(ActiveRender {
                ticket,
                page,
                task: None,
            });
            (document, page, stale)
        };

        release(stale);
        self.inner.backend.clear_surface();
        self.publish();
        debug!(page, requested, ticket = ticket.0, "render started");

        let session = self.clone();
        Box::pin(async move { session.run(ticket, document, page).await })
    }

    /// Updates one layer's visibility and re-renders the current page.
    pub fn set_layer_visibility(&self, layer_id: &str, visible: bool) -> SessionResult<RenderFuture> {
        let page = {
            let mut state = self.inner.state.lock();
            if state.document.is_none() {
                return Err(SessionError::NoDocument);
            }
            if state.visibility.set(layer_id, visible).is_none() {
                return Err(SessionError::UnknownLayer(layer_id.to_string()));
            }
            state.current_page
        };
        debug!(layer = layer_id, visible, page, "layer visibility changed");
        Ok(self.render_page(page))
    }

    async fn run(
        self,
        ticket: RenderTicket,
        document: Arc<dyn DocumentHandle>,
        page: usize,
    ) -> SessionResult<RenderOutcome> {
        let handle = match document.get_page(page).await {
            Ok(handle) => handle,
            Err(err) => return self.fail(ticket, page, err.into()),
        };

        let task = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let snapshot = state.visibility.snapshot();
            let Some(active) = state.active.as_mut().filter(|a| a.ticket == ticket) else {
                debug!(page, "page fetched for a superseded render");
                return Ok(RenderOutcome::Superseded { page });
            };
            let viewport = handle.viewport(self.inner.scale);
            let task = self
                .inner
                .backend
                .create_render_task(handle, viewport, snapshot);
            active.task = Some(Arc::clone(&task));
            task
        };

        let result = task.execute().await;

        {
            let mut state = self.inner.state.lock();
            if !state.is_active(ticket) {
                debug!(page, "discarding completion of a superseded render");
                return Ok(RenderOutcome::Superseded { page });
            }
            match result {
                Ok(()) => {
                    state.active = None;
                    state.current_page = page;
                    state.displayed = Some(task);
                }
                Err(RenderError::Cancelled) => {
                    state.active = None;
                    drop(state);
                    task.dispose();
                    self.publish();
                    return Ok(RenderOutcome::Superseded { page });
                }
                Err(err) => {
                    drop(state);
                    return self.fail(ticket, page, err.into());
                }
            }
        }

        self.inner
            .events
            .lock()
            .push(SessionEvent::PageRendered { page });
        self.publish();
        Ok(RenderOutcome::Rendered { page })
    }

    fn fail(
        &self,
        ticket: RenderTicket,
        page: usize,
        err: SessionError,
    ) -> SessionResult<RenderOutcome> {
        let task = {
            let mut state = self.inner.state.lock();
            if !state.is_active(ticket) {
                debug!(page, error = %err, "ignoring failure of a superseded render");
                return Ok(RenderOutcome::Superseded { page });
            }
            state.active.take().and_then(|active| active.task)
        };
        if let Some(task) = task {
            task.dispose();
        }

        warn!(page, error = %err, "failed to render page");
        self.inner.events.lock().push(SessionEvent::RenderFailed {
            page,
            message: err.to_string(),
        });
        self.publish();
        Err(err)
    }

    fn publish(&self) {
        let view = self.inner.state.lock().view();
        self.inner.view_tx.send_replace(view);
    }

    pub fn view(&self) -> ViewState {
        self.inner.state.lock().view()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.inner.view_tx.subscribe()
    }

    pub fn current_page(&self) -> usize {
        self.inner.state.lock().current_page
    }

    pub fn total_pages(&self) -> usize {
        self.inner.state.lock().page_count
    }

    pub fn is_rendering(&self) -> bool {
        self.inner.state.lock().active.is_some()
    }

    /// Page the in-flight render is heading to, if any.
    pub fn rendering_page(&self) -> Option<usize> {
        self.inner.state.lock().active.as_ref().map(|active| active.page)
    }

    pub fn layer_visibility(&self) -> LayerVisibility {
        self.inner.state.lock().visibility.clone()
    }

    pub fn visibility_snapshot(&self) -> VisibilitySnapshot {
        self.inner.state.lock().visibility.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, spawn_all, FakeBackend, FakeDocument};

    fn session_with(backend: &Arc<FakeBackend>, document: Arc<FakeDocument>) -> RenderSession {
        let events = EventLog::default();
        let session = RenderSession::new(backend.clone(), RenderConfig::default(), events);
        let visibility = crate::layers::LayerModelBuilder::default()
            .build(&document.layer_metadata())
            .visibility;
        session.attach(document, visibility);
        session
    }

    #[tokio::test]
    async fn successful_render_updates_page_only_on_completion() {
        let backend = FakeBackend::gated();
        let session = session_with(&backend, FakeDocument::new(10));

        let render = session.render_page(4);
        assert!(session.is_rendering());
        assert_eq!(session.rendering_page(), Some(4));
        assert_eq!(session.current_page(), 1);

        let handle = tokio::spawn(render);
        settle().await;
        assert_eq!(session.current_page(), 1);

        backend.release(4);
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, RenderOutcome::Rendered { page: 4 });
        assert_eq!(session.current_page(), 4);
        assert!(!session.is_rendering());
        assert_eq!(backend.clear_count(), 1);
    }

    #[tokio::test]
    async fn out_of_range_requests_are_clamped() {
        let backend = FakeBackend::immediate();
        let session = session_with(&backend, FakeDocument::new(7));

        session.render_page(99).await.unwrap();
        assert_eq!(session.current_page(), 7);
        session.render_page(0).await.unwrap();
        assert_eq!(session.current_page(), 1);
        assert_eq!(backend.rendered_pages(), [7, 1]);
    }

    #[tokio::test]
    async fn newer_render_cancels_and_disposes_the_previous_one() {
        let backend = FakeBackend::gated();
        let session = session_with(&backend, FakeDocument::new(10));

        let first = tokio::spawn(session.render_page(2));
        settle().await;
        let second = tokio::spawn(session.render_page(3));
        settle().await;

        let tasks = backend.tasks();
        assert!(tasks[0].is_cancelled());
        assert!(tasks[0].is_disposed());
        assert!(!tasks[1].is_cancelled());

        backend.release(3);
        assert_eq!(
            first.await.unwrap().unwrap(),
            RenderOutcome::Superseded { page: 2 }
        );
        assert_eq!(
            second.await.unwrap().unwrap(),
            RenderOutcome::Rendered { page: 3 }
        );
        assert_eq!(session.current_page(), 3);
    }

    #[tokio::test]
    async fn late_completion_of_a_superseded_render_is_discarded() {
        let backend = FakeBackend::gated().ignoring_cancel();
        let session = session_with(&backend, FakeDocument::new(10));

        let slow = tokio::spawn(session.render_page(2));
        settle().await;
        let fast = tokio::spawn(session.render_page(5));
        settle().await;

        backend.release(5);
        assert_eq!(
            fast.await.unwrap().unwrap(),
            RenderOutcome::Rendered { page: 5 }
        );
        backend.release(2);
        assert_eq!(
            slow.await.unwrap().unwrap(),
            RenderOutcome::Superseded { page: 2 }
        );

        assert_eq!(session.current_page(), 5);
        assert!(!session.is_rendering());
    }

    #[tokio::test]
    async fn rapid_requests_settle_on_the_last_target() {
        let backend = FakeBackend::immediate();
        let session = session_with(&backend, FakeDocument::new(20));

        let renders: Vec<_> = [3, 9, 14, 2, 11]
            .into_iter()
            .map(|page| session.render_page(page))
            .collect();
        let outcomes = spawn_all(renders).await;

        let rendered: Vec<_> = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Ok(RenderOutcome::Rendered { .. })))
            .collect();
        assert_eq!(rendered.len(), 1);
        assert_eq!(session.current_page(), 11);
        let events = session.inner.events.lock().clone();
        assert_eq!(events, [SessionEvent::PageRendered { page: 11 }]);
    }

    #[tokio::test]
    async fn page_fetch_failure_keeps_previous_page() {
        let backend = FakeBackend::immediate();
        let document = FakeDocument::new(10).failing_fetch(5);
        let session = session_with(&backend, document);

        session.render_page(3).await.unwrap();
        let err = session.render_page(5).await.unwrap_err();

        assert!(matches!(err, SessionError::PageFetch(_)));
        assert_eq!(session.current_page(), 3);
        assert!(!session.is_rendering());
        assert!(session
            .inner
            .events
            .lock()
            .contains(&SessionEvent::RenderFailed {
                page: 5,
                message: err.to_string(),
            }));
    }

    #[tokio::test]
    async fn render_error_keeps_previous_page_and_clears_flags() {
        let backend = FakeBackend::immediate().failing_render(4);
        let session = session_with(&backend, FakeDocument::new(10));

        session.render_page(2).await.unwrap();
        let err = session.render_page(4).await.unwrap_err();

        assert!(matches!(err, SessionError::Render(RenderError::Failed { page: 4, .. })));
        assert_eq!(session.view().current_page, 2);
        assert_eq!(session.view().rendering_page, None);
        assert!(backend.tasks().last().unwrap().is_disposed());
    }

    #[tokio::test]
    async fn stale_failure_is_not_surfaced() {
        let backend = FakeBackend::gated().failing_render(2).ignoring_cancel();
        let session = session_with(&backend, FakeDocument::new(10));

        let stale = tokio::spawn(session.render_page(2));
        settle().await;
        let fresh = tokio::spawn(session.render_page(6));
        settle().await;
        backend.release(2);
        backend.release(6);

        assert_eq!(
            stale.await.unwrap().unwrap(),
            RenderOutcome::Superseded { page: 2 }
        );
        fresh.await.unwrap().unwrap();
        assert_eq!(session.current_page(), 6);
        assert!(!session
            .inner
            .events
            .lock()
            .iter()
            .any(|event| matches!(event, SessionEvent::RenderFailed { .. })));
    }

    #[tokio::test]
    async fn layer_toggle_rerenders_current_page_with_new_snapshot() {
        let backend = FakeBackend::immediate();
        let document = FakeDocument::new(5).with_layers(&[("1 0R", "Walls"), ("2 0R", "Pipes")]);
        let session = session_with(&backend, document);

        session.render_page(3).await.unwrap();
        session
            .set_layer_visibility("2 0R", false)
            .unwrap()
            .await
            .unwrap();

        assert_eq!(session.current_page(), 3);
        let snapshots = backend.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[0].is_visible("2 0R"));
        assert!(!snapshots[1].is_visible("2 0R"));
        assert!(snapshots[1].is_visible("1 0R"));
        assert_eq!(backend.rendered_pages(), [3, 3]);
    }

    #[tokio::test]
    async fn unknown_layer_is_rejected_without_rendering() {
        let backend = FakeBackend::immediate();
        let session = session_with(&backend, FakeDocument::new(5));

        let err = session.set_layer_visibility("nope", false).err().unwrap();
        assert!(matches!(err, SessionError::UnknownLayer(id) if id == "nope"));
        assert!(!session.is_rendering());
        assert!(backend.tasks().is_empty());
    }

    #[tokio::test]
    async fn rendering_without_document_fails() {
        let backend = FakeBackend::immediate();
        let session = RenderSession::new(backend.clone(), RenderConfig::default(), EventLog::default());

        assert!(matches!(
            session.render_page(1).await,
            Err(SessionError::NoDocument)
        ));
        assert!(!session.is_rendering());
    }

    #[tokio::test]
    async fn detach_cancels_in_flight_render() {
        let backend = FakeBackend::gated();
        let session = session_with(&backend, FakeDocument::new(5));

        let pending = tokio::spawn(session.render_page(2));
        settle().await;
        session.detach();

        assert!(backend.tasks()[0].is_cancelled());
        assert_eq!(
            pending.await.unwrap().unwrap(),
            RenderOutcome::Superseded { page: 2 }
        );
        assert_eq!(session.view(), ViewState::default());
    }

    #[tokio::test]
    async fn view_changes_are_published() {
        let backend = FakeBackend::immediate();
        let session = session_with(&backend, FakeDocument::new(5));
        let mut views = session.subscribe();
        views.borrow_and_update();

        session.render_page(2).await.unwrap();

        assert!(views.has_changed().unwrap());
        let view = *views.borrow_and_update();
        assert_eq!(
            view,
            ViewState {
                current_page: 2,
                total_pages: 5,
                is_rendering: false,
                rendering_page: None,
            }
        );
    }
}
