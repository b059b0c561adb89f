//! The closed set of mutation kinds the app can queue.
//!
//! Each kind is bound to exactly one endpoint and one default priority by
//! configuration. Adding a kind is a data change: a new variant here plus a
//! row in the endpoint and priority tables, never a new dispatch path.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A mutation category queued by the field app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    CreateIncident,
    UpdateIncident,
    CreateAppointment,
    UpdateAppointment,
    CancelAppointment,
    UpdateSafetyPlan,
    CreateCaseNote,
    UpdateCaseStatus,
    SendMessage,
    UploadEvidence,
    UpdateProfile,
    EmergencyAlert,
}

impl OperationKind {
    /// Every kind, in declaration order.
    pub const ALL: [OperationKind; 12] = [
        Self::CreateIncident,
        Self::UpdateIncident,
        Self::CreateAppointment,
        Self::UpdateAppointment,
        Self::CancelAppointment,
        Self::UpdateSafetyPlan,
        Self::CreateCaseNote,
        Self::UpdateCaseStatus,
        Self::SendMessage,
        Self::UploadEvidence,
        Self::UpdateProfile,
        Self::EmergencyAlert,
    ];

    /// Wire name, matching the serde representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CreateIncident => "CREATE_INCIDENT",
            Self::UpdateIncident => "UPDATE_INCIDENT",
            Self::CreateAppointment => "CREATE_APPOINTMENT",
            Self::UpdateAppointment => "UPDATE_APPOINTMENT",
            Self::CancelAppointment => "CANCEL_APPOINTMENT",
            Self::UpdateSafetyPlan => "UPDATE_SAFETY_PLAN",
            Self::CreateCaseNote => "CREATE_CASE_NOTE",
            Self::UpdateCaseStatus => "UPDATE_CASE_STATUS",
            Self::SendMessage => "SEND_MESSAGE",
            Self::UploadEvidence => "UPLOAD_EVIDENCE",
            Self::UpdateProfile => "UPDATE_PROFILE",
            Self::EmergencyAlert => "EMERGENCY_ALERT",
        }
    }

    /// The domain entity this kind mutates.
    ///
    /// Field-level merge priorities are configured per entity, so all kinds
    /// touching the same record share one priority table.
    #[must_use]
    pub const fn entity(&self) -> &'static str {
        match self {
            Self::CreateIncident | Self::UpdateIncident => "incident",
            Self::CreateAppointment | Self::UpdateAppointment | Self::CancelAppointment => {
                "appointment"
            }
            Self::UpdateSafetyPlan => "safety_plan",
            Self::CreateCaseNote | Self::UpdateCaseStatus => "case",
            Self::SendMessage => "message",
            Self::UploadEvidence => "evidence",
            Self::UpdateProfile => "profile",
            Self::EmergencyAlert => "alert",
        }
    }

    /// Whether this kind creates a new server record rather than editing one.
    #[must_use]
    pub const fn is_create(&self) -> bool {
        matches!(
            self,
            Self::CreateIncident
                | Self::CreateAppointment
                | Self::CreateCaseNote
                | Self::SendMessage
                | Self::UploadEvidence
                | Self::EmergencyAlert
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownOperationKind(s.to_string()))
    }
}
