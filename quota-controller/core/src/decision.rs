use crate::{Quantity, ResourceList, ResourceName};
use std::fmt;
use thiserror::Error;

/// The terminal state of one admission call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Reason,
    pub message: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    Allowed,
    QuotaExceeded,
    InvalidQuotaObject,
    Decode,
    Extraction,
    UnsupportedKind,
    ServiceUnavailable,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Allowed,
    Denied,
    Errored,
}

/// A request that would push a quota's usage past its hard limit.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error(
    "exceeded quota: {quota}, requested: {resource}={requested}, used: {resource}={used}, limited: {resource}={limit}"
)]
pub struct Exceeded {
    pub quota: String,
    pub resource: ResourceName,
    pub used: Quantity,
    pub requested: Quantity,
    pub limit: Quantity,
}

/// Checks `requested` against `hard`, given current `used` usage.
///
/// Only resources present in both the request and the hard limits are
/// checked; anything else is unlimited as far as this quota is concerned.
/// A projection exactly equal to the limit is admitted.
pub fn check(
    quota: &str,
    hard: &ResourceList,
    used: &ResourceList,
    requested: &ResourceList,
) -> Result<(), Exceeded> {
    for (resource, delta) in requested.iter() {
        if *delta <= Quantity::ZERO || !hard.contains(resource) {
            continue;
        }

        let limit = hard.get(resource);
        let current = used.get(resource);
        if current + *delta > limit {
            return Err(Exceeded {
                quota: quota.to_string(),
                resource: resource.clone(),
                used: current,
                requested: *delta,
                limit,
            });
        }
    }

    Ok(())
}

// === impl AdmissionDecision ===

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: Reason::Allowed,
            message: String::new(),
        }
    }

    pub fn code(&self) -> u16 {
        self.reason.code()
    }

    pub fn outcome(&self) -> Outcome {
        self.reason.outcome()
    }
}

impl From<crate::Error> for AdmissionDecision {
    fn from(error: crate::Error) -> Self {
        Self {
            allowed: false,
            reason: error.reason(),
            message: error.to_string(),
        }
    }
}

impl From<Result<(), crate::Error>> for AdmissionDecision {
    fn from(res: Result<(), crate::Error>) -> Self {
        match res {
            Ok(()) => Self::allow(),
            Err(error) => error.into(),
        }
    }
}

// === impl Reason ===

impl Reason {
    /// The HTTP-style status code carried in the response status.
    pub fn code(&self) -> u16 {
        match self {
            Self::Allowed => 200,
            Self::QuotaExceeded => 403,
            Self::InvalidQuotaObject => 422,
            Self::Decode | Self::Extraction | Self::UnsupportedKind => 400,
            Self::ServiceUnavailable => 500,
        }
    }

    /// The cluster API `StatusReason` for the response status.
    pub fn status_reason(&self) -> &'static str {
        match self {
            Self::Allowed => "",
            Self::QuotaExceeded => "Forbidden",
            Self::InvalidQuotaObject => "Invalid",
            Self::Decode | Self::Extraction | Self::UnsupportedKind => "BadRequest",
            Self::ServiceUnavailable => "InternalError",
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Allowed => Outcome::Allowed,
            Self::QuotaExceeded | Self::InvalidQuotaObject => Outcome::Denied,
            Self::Decode | Self::Extraction | Self::UnsupportedKind | Self::ServiceUnavailable => {
                Outcome::Errored
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::QuotaExceeded => "quota_exceeded",
            Self::InvalidQuotaObject => "invalid_quota_object",
            Self::Decode => "decode",
            Self::Extraction => "extraction",
            Self::UnsupportedKind => "unsupported_kind",
            Self::ServiceUnavailable => "service_unavailable",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Outcome ===

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Errored => "errored",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn list(items: &[(&'static str, &str)]) -> ResourceList {
        items
            .iter()
            .map(|(n, q)| (*n, q.parse::<Quantity>().unwrap()))
            .collect()
    }

    #[test]
    fn exact_boundary_is_allowed() {
        let hard = list(&[("cpu", "4")]);
        let used = list(&[("cpu", "3")]);
        assert_eq!(check("q", &hard, &used, &list(&[("cpu", "1")])), Ok(()));
    }

    #[test]
    fn smallest_unit_over_is_denied() {
        let hard = list(&[("cpu", "4")]);
        let used = list(&[("cpu", "3")]);
        let err = check("q", &hard, &used, &list(&[("cpu", "1001m")])).unwrap_err();
        assert_eq!(
            err,
            Exceeded {
                quota: "q".to_string(),
                resource: "cpu".into(),
                used: "3".parse().unwrap(),
                requested: "1001m".parse().unwrap(),
                limit: "4".parse().unwrap(),
            }
        );

        let hard = list(&[("pods", "2")]);
        let used = list(&[("pods", "2")]);
        assert!(check("q", &hard, &used, &list(&[("pods", "1n")])).is_err());
    }

    #[test]
    fn untracked_resources_are_unlimited() {
        let hard = list(&[("cpu", "1")]);
        let requested = list(&[("memory", "1Ei"), ("count/secrets", "1000000")]);
        assert_eq!(check("q", &hard, &ResourceList::default(), &requested), Ok(()));
    }

    #[test]
    fn zero_deltas_are_not_checked() {
        let hard = list(&[("cpu", "1")]);
        let used = list(&[("cpu", "5")]);
        assert_eq!(check("q", &hard, &used, &list(&[("cpu", "0")])), Ok(()));
    }

    #[test]
    fn denial_message_names_the_triple() {
        let hard = list(&[("requests.memory", "1Gi")]);
        let used = list(&[("memory", "768Mi")]);
        let err = check("team-a", &hard, &used, &list(&[("memory", "512Mi")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "exceeded quota: team-a, requested: requests.memory=536870912, \
             used: requests.memory=805306368, limited: requests.memory=1073741824"
        );
    }

    #[test]
    fn decisions_carry_codes() {
        let decision = AdmissionDecision::from(Err::<(), _>(Error::UnsupportedKind(
            "apps/v1/Deployment".to_string(),
        )));
        assert!(!decision.allowed);
        assert_eq!(decision.code(), 400);
        assert_eq!(decision.outcome(), Outcome::Errored);

        let decision = AdmissionDecision::from(Err::<(), _>(Error::InvalidQuotaObject(
            "negative limit".to_string(),
        )));
        assert_eq!(decision.code(), 422);
        assert_eq!(decision.reason.status_reason(), "Invalid");
        assert_eq!(decision.outcome(), Outcome::Denied);

        assert!(AdmissionDecision::from(Ok(())).allowed);
    }
}
