//! HTTP review API for pending pages.
//!
//! A reviewer lists the pages the readers could not resolve, looks at each
//! one and answers for it. Every answer runs a resolution pass with that
//! answer applied to that page only, then stamps and aggregates whatever
//! was committed.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use base64::Engine as _;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::aggregate::AggregateReport;
use crate::error::GradingError;
use crate::pdf::PdfBundle;
use crate::pipeline;
use crate::reconcile::{rotate_image, Decision, PageOrigin, Prompt, ReconciliationEngine, Resolver};
use crate::session::Session;

/// The session and the readers behind the API.
pub struct Reviewer {
    session: Session,
    engine: ReconciliationEngine,
}

impl Reviewer {
    pub fn new(session: Session, engine: ReconciliationEngine) -> Self {
        Self { session, engine }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    reviewer: Arc<Mutex<Reviewer>>,
}

impl AppState {
    pub fn new(reviewer: Reviewer) -> Self {
        Self {
            reviewer: Arc::new(Mutex::new(reviewer)),
        }
    }
}

type ApiError = (StatusCode, String);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// One pending page as listed by `GET /pending`.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PendingView {
    pub index: usize,
    pub source_file: String,
    pub source_page_index: usize,
    pub code: Option<String>,
    pub student_id: Option<String>,
    /// `"code"` or `"student"`.
    pub missing: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PageImage {
    pub index: usize,
    pub mime: &'static str,
    pub data: String,
}

/// Body of `POST /pending/:index`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ReviewAction {
    Provide { value: String },
    Add,
    Skip,
}

impl From<ReviewAction> for Decision {
    fn from(action: ReviewAction) -> Self {
        match action {
            ReviewAction::Provide { value } => Decision::Provide(value),
            ReviewAction::Add => Decision::AddToRoster,
            ReviewAction::Skip => Decision::Skip,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub committed: Vec<String>,
    pub pending: usize,
    pub stamped: usize,
    pub aggregates_built: Vec<String>,
    pub aggregates_extended: Vec<(String, usize)>,
}

/// Answers the first prompt about one page; every other prompt is skipped.
pub struct PresetResolver {
    target: PageOrigin,
    decision: Option<Decision>,
}

impl PresetResolver {
    pub fn new(target: PageOrigin, decision: Decision) -> Self {
        Self {
            target,
            decision: Some(decision),
        }
    }
}

impl Resolver for PresetResolver {
    fn resolve(&mut self, prompt: &Prompt<'_>) -> Decision {
        if *prompt.origin() == self.target {
            if let Some(decision) = self.decision.take() {
                return decision;
            }
        }
        Decision::Skip
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pending", get(get_pending))
        .route("/pending/:index", axum::routing::post(post_decision))
        .route("/pending/:index/image", get(get_page_image))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the review API on `bind` until the process is stopped.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Review server listening on http://{}", bind);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

async fn get_pending(State(state): State<AppState>) -> ApiResult<Vec<PendingView>> {
    with_reviewer(state, |reviewer| Ok(list_pending(reviewer))).await
}

async fn get_page_image(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> ApiResult<PageImage> {
    with_reviewer(state, move |reviewer| page_image(reviewer, index)).await
}

async fn post_decision(
    State(state): State<AppState>,
    Path(index): Path<usize>,
    Json(action): Json<ReviewAction>,
) -> ApiResult<ReviewOutcome> {
    with_reviewer(state, move |reviewer| apply_decision(reviewer, index, action)).await
}

/// Run `f` on a blocking thread with the reviewer locked.
async fn with_reviewer<T, F>(state: AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Reviewer) -> std::result::Result<T, ApiError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || {
        let mut reviewer = state
            .reviewer
            .lock()
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "session lock poisoned".to_string()))?;
        f(&mut reviewer)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("task failed: {}", e)))?;
    result.map(Json)
}

// ============================================================================
// Operations
// ============================================================================

fn list_pending(reviewer: &Reviewer) -> Vec<PendingView> {
    reviewer
        .session
        .ledger
        .pending_pages
        .iter()
        .enumerate()
        .map(|(index, page)| PendingView {
            index,
            source_file: page.source_file.clone(),
            source_page_index: page.source_page_index,
            code: page.code.clone(),
            student_id: page.student_id.clone(),
            missing: if page.code.is_none() { "code" } else { "student" },
        })
        .collect()
}

fn page_image(reviewer: &Reviewer, index: usize) -> std::result::Result<PageImage, ApiError> {
    let session = &reviewer.session;
    pending_origin(session, index)?;
    let bundle = PdfBundle::open(&session.layout.carryover).map_err(api_error)?;
    let image = bundle.page_image(index).map_err(api_error)?;
    let image = rotate_image(image, session.config.rotate);

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| api_error(e.into()))?;
    Ok(PageImage {
        index,
        mime: "image/png",
        data: base64::engine::general_purpose::STANDARD.encode(png),
    })
}

fn apply_decision(
    reviewer: &mut Reviewer,
    index: usize,
    action: ReviewAction,
) -> std::result::Result<ReviewOutcome, ApiError> {
    let origin = pending_origin(&reviewer.session, index)?;
    info!(
        "Review of {} page {}: {:?}",
        origin.source_file, origin.page_index, action
    );
    let mut preset = PresetResolver::new(origin, action.into());

    let Reviewer { session, engine } = reviewer;
    let result = engine
        .resolve_pending(session, Some(&mut preset))
        .and_then(|report| pipeline::finish_pass(session).map(|pass| (report, pass)));
    let (report, (stamped, aggregates)) = match result {
        Ok(done) => done,
        Err(e) => {
            // Drop whatever the failed pass left in memory; the files are authoritative
            if let Err(reload) = session.reload() {
                warn!("Could not reload the session after a failed review: {}", reload);
            }
            return Err(api_error(e));
        }
    };
    let AggregateReport { built, extended } = aggregates;
    Ok(ReviewOutcome {
        committed: report.committed,
        pending: session.ledger.pending_pages.len(),
        stamped,
        aggregates_built: built,
        aggregates_extended: extended,
    })
}

fn pending_origin(session: &Session, index: usize) -> std::result::Result<PageOrigin, ApiError> {
    session
        .ledger
        .pending_pages
        .get(index)
        .map(|page| PageOrigin {
            source_file: page.source_file.clone(),
            page_index: page.source_page_index,
        })
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no pending page {}", index)))
}

fn api_error(e: GradingError) -> ApiError {
    let status = match &e {
        GradingError::MissingPrerequisite(_) => StatusCode::CONFLICT,
        GradingError::MalformedCode(_) | GradingError::Roster(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!("Review request failed: {}", e);
    (status, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::tests::{engine, write_scan};
    use crate::session::tests::open_session;

    /// A reviewer with two pending pages: one without a code and one cover
    /// page whose student is unknown.
    fn reviewer(dir: &std::path::Path) -> Reviewer {
        let mut session = open_session(dir);
        let scan = write_scan(&session, "batch1.pdf", &[20, 40]);
        let engine = engine(&[(40, "MTH309-C003-P00")], &[(40, "77777777")]);
        engine.process_scan(&mut session, &scan, None).unwrap();
        Reviewer::new(session, engine)
    }

    #[test]
    fn test_review_action_json() {
        let provide: ReviewAction =
            serde_json::from_str(r#"{"action":"provide","value":"MTH309-C001-P01"}"#).unwrap();
        assert_eq!(
            Decision::from(provide),
            Decision::Provide("MTH309-C001-P01".to_string())
        );
        let add: ReviewAction = serde_json::from_str(r#"{"action":"add"}"#).unwrap();
        assert_eq!(Decision::from(add), Decision::AddToRoster);
        assert!(serde_json::from_str::<ReviewAction>(r#"{"action":"delete"}"#).is_err());
    }

    #[test]
    fn test_preset_resolver_answers_target_once() {
        let target = PageOrigin {
            source_file: "a.pdf".to_string(),
            page_index: 1,
        };
        let other = PageOrigin {
            source_file: "a.pdf".to_string(),
            page_index: 0,
        };
        let mut preset = PresetResolver::new(target.clone(), Decision::AddToRoster);
        let prompt = |origin| Prompt::MissingCode {
            origin,
            image: None,
            rejected: None,
        };
        assert_eq!(preset.resolve(&prompt(&other)), Decision::Skip);
        assert_eq!(preset.resolve(&prompt(&target)), Decision::AddToRoster);
        assert_eq!(preset.resolve(&prompt(&target)), Decision::Skip);
    }

    #[test]
    fn test_list_pending_reports_what_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let reviewer = reviewer(dir.path());
        let pending = list_pending(&reviewer);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].missing, "code");
        assert_eq!(pending[1].missing, "student");
        assert_eq!(pending[1].code.as_deref(), Some("MTH309-C003-P00"));
        assert_eq!(pending[1].student_id.as_deref(), Some("77777777"));
    }

    #[test]
    fn test_page_image_is_base64_png() {
        let dir = tempfile::tempdir().unwrap();
        let reviewer = reviewer(dir.path());
        let image = page_image(&reviewer, 0).unwrap();
        let png = base64::engine::general_purpose::STANDARD
            .decode(image.data)
            .unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
        assert_eq!(page_image(&reviewer, 5).unwrap_err().0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_decision_applies_to_one_page_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut reviewer = reviewer(dir.path());

        let outcome = apply_decision(&mut reviewer, 1, ReviewAction::Add).unwrap();
        assert_eq!(outcome.committed, vec!["MTH309-C003-P00"]);
        assert_eq!(outcome.pending, 1);
        assert_eq!(outcome.stamped, 1);
        assert_eq!(outcome.aggregates_built, vec!["MTH309_page_0.pdf"]);
        assert!(reviewer.session.roster.contains("77777777"));
        assert_eq!(
            reviewer.session.roster.code_of("77777777"),
            Some("MTH309-C003")
        );

        let outcome = apply_decision(
            &mut reviewer,
            0,
            ReviewAction::Provide {
                value: "MTH309-C003-P01".to_string(),
            },
        )
        .unwrap();
        assert_eq!(outcome.committed, vec!["MTH309-C003-P01"]);
        assert_eq!(outcome.pending, 0);
        assert!(!reviewer.session.layout.carryover.exists());
    }

    #[test]
    fn test_failed_decision_restores_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut reviewer = reviewer(dir.path());
        reviewer
            .session
            .ledger
            .processed_scans
            .insert("unsaved.pdf".to_string());
        std::fs::remove_file(&reviewer.session.layout.carryover).unwrap();

        let err = apply_decision(&mut reviewer, 1, ReviewAction::Add).unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);
        assert!(!reviewer.session.ledger.processed_scans.contains("unsaved.pdf"));
        assert_eq!(reviewer.session.ledger.pending_pages.len(), 2);
        assert!(!reviewer.session.roster.contains("77777777"));
    }
}
