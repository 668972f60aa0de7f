//! Test harness: in-memory SQLite, a manual clock and recording collaborators

use crate::collaborators::{
    AuditEvent, AuditRecorder, Clock, Collaborators, DbQueueProvider, EventKind,
    ExistenceChecker, ManualClock, NotificationSender,
};
use crate::db::models::*;
use crate::db::{schema, DbPool};
use crate::engine::{EngineSettings, ReviewEngine, SubmitReview};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sea_orm::{ActiveModelTrait, EntityTrait, IntoActiveModel, Set};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Monday 2 March 2026, 09:00 UTC
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn feedback() -> String {
    "A quiet, patient novel about a lighthouse keeper and the town that forgets him. \
     The middle drags a little, but the final chapters land with real weight and the \
     narration never loses its warmth."
        .to_string()
}

#[derive(Default)]
pub struct RecordingNotifier {
    fail: bool,
    sent: Mutex<Vec<(Uuid, EventKind, serde_json::Value)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(Uuid, EventKind, serde_json::Value)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.sent().into_iter().map(|(_, kind, _)| kind).collect()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn send(&self, user_id: Uuid, kind: EventKind, data: serde_json::Value) -> Result<()> {
        if self.fail {
            return Err(AppError::Collaborator {
                collaborator: "notifier",
                message: "smtp relay unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push((user_id, kind, data));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    fail: bool,
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    pub fn actions(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.action.clone())
            .collect()
    }
}

#[async_trait]
impl AuditRecorder for RecordingAudit {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        if self.fail {
            return Err(AppError::Collaborator {
                collaborator: "audit",
                message: "audit store unavailable".to_string(),
            });
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Existence checker answering from a fixed table; unknown links are present
#[derive(Default)]
pub struct ScriptedChecker {
    answers: HashMap<String, std::result::Result<bool, String>>,
}

impl ScriptedChecker {
    pub fn with(mut self, link: &str, answer: std::result::Result<bool, &str>) -> Self {
        self.answers
            .insert(link.to_string(), answer.map_err(str::to_string));
        self
    }
}

#[async_trait]
impl ExistenceChecker for ScriptedChecker {
    async fn still_published(&self, review_link: &str) -> Result<bool> {
        match self.answers.get(review_link) {
            Some(Ok(published)) => Ok(*published),
            Some(Err(message)) => Err(AppError::Collaborator {
                collaborator: "existence_checker",
                message: message.clone(),
            }),
            None => Ok(true),
        }
    }
}

pub struct Harness {
    pub engine: ReviewEngine,
    pub db: DbPool,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub audit: Arc<RecordingAudit>,
    pub admin: Uuid,
}

pub async fn harness() -> Harness {
    harness_with(false).await
}

/// Harness whose notifier and audit recorder fail when `failing` is set
pub async fn harness_with(failing: bool) -> Harness {
    let db = DbPool::sqlite_memory().await.unwrap();
    schema::ensure_schema(db.write()).await.unwrap();

    let clock = Arc::new(ManualClock::new(t0()));
    let notifier = Arc::new(RecordingNotifier {
        fail: failing,
        ..Default::default()
    });
    let audit = Arc::new(RecordingAudit {
        fail: failing,
        ..Default::default()
    });
    let clock_dyn: Arc<dyn Clock> = clock.clone();

    let collaborators = Collaborators::new(
        notifier.clone(),
        audit.clone(),
        Arc::new(DbQueueProvider::new(db.clone(), clock_dyn.clone())),
    );
    let engine = ReviewEngine::new(db.clone(), collaborators, clock_dyn, EngineSettings::default());

    Harness {
        engine,
        db,
        clock,
        notifier,
        audit,
        admin: Uuid::new_v4(),
    }
}

impl Harness {
    pub async fn campaign(&self, credits: i32) -> AuthorCampaign {
        AuthorCampaignActiveModel {
            id: Set(Uuid::new_v4()),
            author_id: Set(Uuid::new_v4()),
            book_id: Set(Uuid::new_v4()),
            credits_remaining: Set(credits),
            credits_consumed: Set(0),
            reviews_delivered: Set(0),
            created_at: Set(t0().into()),
            updated_at: Set(t0().into()),
        }
        .insert(self.db.write())
        .await
        .unwrap()
    }

    pub async fn campaign_state(&self, id: Uuid) -> AuthorCampaign {
        self.engine.repository().find_campaign(id).await.unwrap().unwrap()
    }

    async fn insert_assignment(
        &self,
        campaign: &AuthorCampaign,
        reader_id: Uuid,
        format: BookFormat,
        status: AssignmentStatus,
        queue_position: i32,
    ) -> Assignment {
        let now = self.clock.now();
        let waiting = status == AssignmentStatus::Waiting;
        AssignmentActiveModel {
            id: Set(Uuid::new_v4()),
            book_id: Set(campaign.book_id),
            reader_id: Set(reader_id),
            campaign_id: Set(campaign.id),
            format: Set(format),
            status: Set(status),
            queue_position: Set(queue_position),
            is_buffer: Set(waiting),
            scheduled_for: Set(None),
            deadline_at: Set(if waiting {
                None
            } else {
                Some((now + Duration::days(7)).into())
            }),
            deadline_extension_reason: Set(None),
            replaces_review_id: Set(None),
            reassigned_at: Set(None),
            reassigned_by: Set(None),
            reassignment_reason: Set(None),
            validated_at: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
        .insert(self.db.write())
        .await
        .unwrap()
    }

    pub async fn assignment(
        &self,
        campaign: &AuthorCampaign,
        format: BookFormat,
        status: AssignmentStatus,
    ) -> Assignment {
        self.insert_assignment(campaign, Uuid::new_v4(), format, status, 0)
            .await
    }

    /// A reader waiting in the book's queue
    pub async fn queued(&self, campaign: &AuthorCampaign, position: i32) -> Assignment {
        self.insert_assignment(
            campaign,
            Uuid::new_v4(),
            BookFormat::Ebook,
            AssignmentStatus::Waiting,
            position,
        )
        .await
    }

    pub fn submission(&self, assignment: &Assignment) -> SubmitReview {
        SubmitReview {
            assignment_id: assignment.id,
            review_link: format!("https://www.amazon.com/review/{}", assignment.id.simple()),
            star_rating: 4,
            feedback_text: feedback(),
            published_confirmed: true,
            completion_percent: 100,
        }
    }

    pub async fn submitted_review(&self, campaign: &AuthorCampaign, format: BookFormat) -> Review {
        self.submitted_review_for(campaign, Uuid::new_v4(), format)
            .await
    }

    pub async fn submitted_review_for(
        &self,
        campaign: &AuthorCampaign,
        reader_id: Uuid,
        format: BookFormat,
    ) -> Review {
        let assignment = self
            .insert_assignment(campaign, reader_id, format, AssignmentStatus::InProgress, 0)
            .await;
        self.engine
            .submit_review(reader_id, self.submission(&assignment))
            .await
            .unwrap()
    }

    pub async fn review(&self, id: Uuid) -> Review {
        ReviewEntity::find_by_id(id)
            .one(self.db.write())
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn assignment_of(&self, review: &Review) -> Assignment {
        self.engine
            .repository()
            .get_assignment(review.assignment_id)
            .await
            .unwrap()
    }

    pub async fn open_issue(&self, review_id: Uuid) -> Issue {
        self.engine
            .create_issue(
                review_id,
                crate::engine::CreateIssue {
                    issue_type: IssueType::LowQuality,
                    severity: IssueSeverity::Medium,
                    description: "Feedback reads like a summary".to_string(),
                },
                self.admin,
            )
            .await
            .unwrap()
    }

    pub async fn set_assignment_status(&self, id: Uuid, status: AssignmentStatus) {
        let assignment = self.engine.repository().get_assignment(id).await.unwrap();
        let mut active = assignment.into_active_model();
        active.status = Set(status);
        active.deadline_at = Set(Some((self.clock.now() + Duration::days(7)).into()));
        active.update(self.db.write()).await.unwrap();
    }

    /// Make an assignment a guarantee replacement for `original_review_id`
    pub async fn mark_replacement(&self, assignment_id: Uuid, original_review_id: Uuid) {
        let assignment = self.engine.repository().get_assignment(assignment_id).await.unwrap();
        let mut active = assignment.into_active_model();
        active.replaces_review_id = Set(Some(original_review_id));
        active.update(self.db.write()).await.unwrap();
    }
}
