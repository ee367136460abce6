//! Organizational roles and acting identities.
//!
//! A [`RoleCode`] names an organizational function that the stage catalog
//! requires; an [`Identity`] names the person who holds it. The two are kept
//! apart so that reassigning a role never touches recorded workflow history.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Short code for an organizational function authorized at certain stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoleCode {
    /// Site TSD Lead: registers initiatives and drives trial, savings and closure.
    #[serde(rename = "STLD")]
    SiteTsdLead,

    /// Site Head: first management approval.
    #[serde(rename = "SH")]
    SiteHead,

    /// Engineering Head: defines responsibilities and the conditional path.
    #[serde(rename = "EH")]
    EngineeringHead,

    /// Initiative Lead: owns the dynamically bound stages 4, 5 and 6.
    #[serde(rename = "IL")]
    InitiativeLead,

    /// Corporate TSD: periodic status review.
    #[serde(rename = "CTSD")]
    CorporateTsd,
}

impl RoleCode {
    /// All role codes, in catalog order of first appearance.
    pub const ALL: [RoleCode; 5] = [
        RoleCode::SiteTsdLead,
        RoleCode::SiteHead,
        RoleCode::EngineeringHead,
        RoleCode::InitiativeLead,
        RoleCode::CorporateTsd,
    ];

    /// Returns the short code used in storage and configuration.
    pub fn code(&self) -> &'static str {
        match self {
            RoleCode::SiteTsdLead => "STLD",
            RoleCode::SiteHead => "SH",
            RoleCode::EngineeringHead => "EH",
            RoleCode::InitiativeLead => "IL",
            RoleCode::CorporateTsd => "CTSD",
        }
    }

    /// Returns the human-readable title of the role.
    pub fn title(&self) -> &'static str {
        match self {
            RoleCode::SiteTsdLead => "Site TSD Lead",
            RoleCode::SiteHead => "Site Head",
            RoleCode::EngineeringHead => "Engineering Head",
            RoleCode::InitiativeLead => "Initiative Lead",
            RoleCode::CorporateTsd => "Corporate TSD",
        }
    }
}

impl fmt::Display for RoleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.code())
    }
}

impl FromStr for RoleCode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RoleCode::ALL
            .into_iter()
            .find(|role| role.code().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown role code: {}", s))
    }
}

/// A reference to a user, as handed over by the authentication layer.
///
/// Identities compare exactly; the engine does not normalize them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wraps a user reference (typically an e-mail address).
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the underlying reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}
