// db/types.rs
// Row structures returned by database operations

use crate::utils::{currency, id_label_name};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which kind of actor a per-subsession record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Participant,
    Experimenter,
}

/// One run of an experiment across all its subsessions and participants
#[derive(Debug, Clone)]
pub struct Session {
    pub id: i64,
    /// Session type, as defined in the experimenter's session configuration
    pub session_type: Option<String>,
    pub label: Option<String>,
    /// Randomly generated unique identifier for the session
    pub code: String,
    pub experimenter_id: Option<i64>,
    /// When the experimenter started the session (RFC 3339)
    pub time_started: Option<String>,
    /// Head of the subsession chain
    pub first_subsession_id: Option<i64>,
    pub is_for_mturk: bool,
    pub mturk_payment_was_sent: bool,
    pub hidden: bool,
    /// Code version the session ran under, for later replication
    pub git_commit_timestamp: Option<String>,
    /// Show-up fee, in cents
    pub base_pay: i64,
    pub comment: String,
    pub participants_assigned: bool,
    /// Whether it's a test session, demo session, etc.
    pub special_category: Option<String>,
    pub demo_already_used: bool,
    /// Whole hierarchy has been created, not only the session row itself
    pub ready: bool,
    pub created_at: String,
}

impl Session {
    pub fn name(&self) -> String {
        id_label_name(self.id, self.label.as_deref())
    }

    pub fn base_pay_display(&self) -> String {
        currency(self.base_pay)
    }
}

/// Fields for inserting a new session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_type: Option<String>,
    pub label: Option<String>,
    /// Show-up fee, in cents
    pub base_pay: i64,
    pub is_for_mturk: bool,
    pub special_category: Option<String>,
    pub git_commit_timestamp: Option<String>,
}

impl Default for NewSession {
    fn default() -> Self {
        Self {
            session_type: None,
            label: None,
            base_pay: 0,
            is_for_mturk: true,
            special_category: None,
            git_commit_timestamp: None,
        }
    }
}

/// One stage of a multi-stage experiment
#[derive(Debug, Clone)]
pub struct Subsession {
    pub id: i64,
    /// Owning session; set by add_subsession
    pub session_id: Option<i64>,
    /// Which experiment app this stage belongs to
    pub app_label: String,
    pub label: Option<String>,
    /// 0-based position in the session's chain; set by chain_subsessions
    pub index_in_subsessions: i64,
    pub next_subsession_id: Option<i64>,
    pub previous_subsession_id: Option<i64>,
}

impl Subsession {
    pub fn name(&self) -> String {
        id_label_name(self.id, self.label.as_deref())
    }
}

/// A configuration variant applied within a subsession
#[derive(Debug, Clone)]
pub struct Treatment {
    pub id: i64,
    pub subsession_id: i64,
    pub session_id: Option<i64>,
    pub label: Option<String>,
}

/// Per-subsession record of a session actor
#[derive(Debug, Clone)]
pub struct SubsessionUser {
    pub id: i64,
    pub subsession_id: i64,
    pub role: UserRole,
    /// Cents; None until the stage's payoff has been computed
    pub payoff: Option<i64>,
    pub session_participant_id: Option<i64>,
    pub session_experimenter_id: Option<i64>,
    pub me_in_next_id: Option<i64>,
    pub me_in_previous_id: Option<i64>,
}

/// A person taking part in one session
#[derive(Debug, Clone)]
pub struct SessionParticipant {
    pub id: i64,
    pub session_id: i64,
    /// Join key across subsession datasets; same across all stages
    pub code: String,
    /// Whether this participant's start URL was opened
    pub visited: bool,
    /// Health of last server request
    pub last_request_succeeded: Option<bool>,
    pub ip_address: Option<String>,
    pub is_on_wait_page: bool,
    pub current_page: Option<String>,
    /// Free-form variable bag shared across the participant's stages
    pub vars: serde_json::Value,
    pub index_in_subsessions: i64,
    /// Head of this participant's per-subsession record chain
    pub me_in_first_id: Option<i64>,
    /// Set when a problem during the run makes the data unusable
    pub exclude_from_data_analysis: bool,
    pub time_started: Option<String>,
    pub mturk_assignment_id: Option<String>,
    pub mturk_worker_id: Option<String>,
    /// Assigned by the experimenter, e.g. via a participant_label URL param
    pub label: Option<String>,
}

impl SessionParticipant {
    pub fn name(&self) -> String {
        id_label_name(self.id, self.label.as_deref())
    }

    pub fn start_url(&self) -> String {
        format!("/InitializeSessionParticipant/{}", self.code)
    }

    pub fn status(&self) -> &'static str {
        if self.is_on_wait_page { "Waiting" } else { "" }
    }
}

/// The experimenter running one session
#[derive(Debug, Clone)]
pub struct SessionExperimenter {
    pub id: i64,
    pub code: String,
    pub visited: bool,
    pub last_request_succeeded: Option<bool>,
    pub ip_address: Option<String>,
    pub is_on_wait_page: bool,
    pub current_page: Option<String>,
    pub vars: serde_json::Value,
    pub index_in_subsessions: i64,
    pub me_in_first_id: Option<i64>,
}

impl SessionExperimenter {
    pub fn start_url(&self) -> String {
        format!("/InitializeSessionExperimenter/{}/", self.code)
    }

    pub fn status(&self) -> &'static str {
        if self.is_on_wait_page { "Waiting" } else { "" }
    }
}
