//! Identifier types shared across the binding, the provided/required
//! instance descriptors and the process-wide id allocators.

use keel::logging;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

pub type ServiceId = u32;
pub type InstanceId = u32;
pub type EventId = u32;
pub type MethodId = u32;
pub type ClientId = u32;
pub type SessionId = u32;
pub type MajorVersion = u32;
pub type MinorVersion = u32;

/// Unique within one process per skeleton connection ever created.
pub type ConnectionId = u32;

const IDENTIFIER_PREFIX: &str = "IpcBinding";
const MAX_CONFIGURABLE_ID: u32 = 0xFFFF_FFFE;

/// A concrete service endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProvidedServiceInstanceId {
    pub service_id: ServiceId,
    pub instance_id: InstanceId,
    pub major_version: MajorVersion,
    pub minor_version: MinorVersion,
}

/// Instance part of a required service instance. `Any` matches every
/// instance id of the service.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum InstanceSelector {
    Exact(InstanceId),
    Any,
}

/// What a consumer asks for. With a concrete instance id it matches only the
/// equal provided id; with the wildcard it matches any instance of the same
/// service/major/minor.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequiredServiceInstanceId {
    pub service_id: ServiceId,
    pub major_version: MajorVersion,
    pub minor_version: MinorVersion,
    pub instance: InstanceSelector,
}

#[derive(Debug, Eq, PartialEq)]
pub enum IdentifierError {
    BadPrefix,
    BadFieldCount,
    BadNumber,
    OutOfRange,
}

impl ProvidedServiceInstanceId {
    /// Parses the configuration string form
    /// `"IpcBinding:<service_id>:<instance_id>:<major>:<minor>"`.
    pub fn try_from_identifier(text: &str) -> Result<ProvidedServiceInstanceId, IdentifierError> {
        let mut fields = text.split(':');

        if fields.next() != Some(IDENTIFIER_PREFIX) {
            return Err(IdentifierError::BadPrefix);
        }

        let mut parse_field = |limit: u32| -> Result<u32, IdentifierError> {
            let field = fields.next().ok_or(IdentifierError::BadFieldCount)?;
            let value: u32 = field.parse().map_err(|_| IdentifierError::BadNumber)?;

            if value > limit {
                return Err(IdentifierError::OutOfRange);
            }

            Ok(value)
        };

        let service_id = parse_field(MAX_CONFIGURABLE_ID)?;
        let instance_id = parse_field(MAX_CONFIGURABLE_ID)?;
        let major_version = parse_field(u32::max_value())?;
        let minor_version = parse_field(u32::max_value())?;

        if fields.next().is_some() {
            return Err(IdentifierError::BadFieldCount);
        }

        Ok(ProvidedServiceInstanceId {
            service_id,
            instance_id,
            major_version,
            minor_version,
        })
    }

    /// Parses an identifier from configuration. A malformed identifier is a
    /// contract violation: it is logged fatally and terminates the process.
    pub fn from_identifier(text: &str, log: &logging::Logger) -> ProvidedServiceInstanceId {
        match Self::try_from_identifier(text) {
            Ok(provided) => provided,
            Err(err) => {
                logging::crit!(log, "malformed provided instance identifier";
                               "context" => "from_identifier",
                               "identifier" => text,
                               "error" => ?err);
                panic!("Malformed provided instance identifier {:?}: {:?}", text, err);
            }
        }
    }

    /// True when the wire coordinates of a message header address this
    /// instance. The minor version does not travel on the wire.
    #[inline]
    pub fn matches_wire(&self, service_id: ServiceId, instance_id: InstanceId, major: MajorVersion) -> bool {
        self.service_id == service_id && self.instance_id == instance_id && self.major_version == major
    }
}

impl fmt::Display for ProvidedServiceInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            IDENTIFIER_PREFIX, self.service_id, self.instance_id, self.major_version, self.minor_version
        )
    }
}

impl RequiredServiceInstanceId {
    /// True when the provided instance satisfies this requirement.
    #[inline]
    pub fn matches(&self, provided: &ProvidedServiceInstanceId) -> bool {
        if self.service_id != provided.service_id
            || self.major_version != provided.major_version
            || self.minor_version != provided.minor_version
        {
            return false;
        }

        match self.instance {
            InstanceSelector::Exact(instance_id) => instance_id == provided.instance_id,
            InstanceSelector::Any => true,
        }
    }
}

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Allocates a process-unique client id. Starts at 1; wraparound is not a
/// practical concern for a per-proxy allocation.
#[inline]
pub fn allocate_client_id() -> ClientId {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Allocates a process-unique skeleton connection id.
#[inline]
pub fn allocate_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_roundtrip() {
        let provided = ProvidedServiceInstanceId {
            service_id: 7,
            instance_id: 3,
            major_version: 1,
            minor_version: 0,
        };

        let text = provided.to_string();
        assert_eq!(text, "IpcBinding:7:3:1:0");
        assert_eq!(ProvidedServiceInstanceId::try_from_identifier(&text).unwrap(), provided);
    }

    #[test]
    fn test_identifier_rejects_bad_prefix() {
        assert_eq!(
            ProvidedServiceInstanceId::try_from_identifier("SomeBinding:1:2:3:4"),
            Err(IdentifierError::BadPrefix)
        );
    }

    #[test]
    fn test_identifier_rejects_field_count() {
        assert_eq!(
            ProvidedServiceInstanceId::try_from_identifier("IpcBinding:1:2:3"),
            Err(IdentifierError::BadFieldCount)
        );
        assert_eq!(
            ProvidedServiceInstanceId::try_from_identifier("IpcBinding:1:2:3:4:5"),
            Err(IdentifierError::BadFieldCount)
        );
    }

    #[test]
    fn test_identifier_rejects_range() {
        assert_eq!(
            ProvidedServiceInstanceId::try_from_identifier("IpcBinding:4294967295:2:3:4"),
            Err(IdentifierError::OutOfRange)
        );
        assert_eq!(
            ProvidedServiceInstanceId::try_from_identifier("IpcBinding:1:4294967295:3:4"),
            Err(IdentifierError::OutOfRange)
        );
    }

    #[test]
    fn test_identifier_rejects_non_numeric() {
        assert_eq!(
            ProvidedServiceInstanceId::try_from_identifier("IpcBinding:a:2:3:4"),
            Err(IdentifierError::BadNumber)
        );
    }

    #[test]
    #[should_panic(expected = "Malformed provided instance identifier")]
    fn test_from_identifier_terminates_on_violation() {
        let log = logging::discard();
        let _ = ProvidedServiceInstanceId::from_identifier("bogus", &log);
    }

    #[test]
    fn test_required_matching() {
        let provided = ProvidedServiceInstanceId {
            service_id: 7,
            instance_id: 3,
            major_version: 1,
            minor_version: 0,
        };

        let exact = RequiredServiceInstanceId {
            service_id: 7,
            major_version: 1,
            minor_version: 0,
            instance: InstanceSelector::Exact(3),
        };
        let other_instance = RequiredServiceInstanceId {
            instance: InstanceSelector::Exact(4),
            ..exact
        };
        let wildcard = RequiredServiceInstanceId {
            instance: InstanceSelector::Any,
            ..exact
        };
        let wrong_minor = RequiredServiceInstanceId {
            minor_version: 9,
            ..wildcard
        };

        assert!(exact.matches(&provided));
        assert!(!other_instance.matches(&provided));
        assert!(wildcard.matches(&provided));
        assert!(!wrong_minor.matches(&provided));
    }

    #[test]
    fn test_allocators_are_monotonic() {
        let first = allocate_client_id();
        let second = allocate_client_id();
        assert!(second > first);

        let first = allocate_connection_id();
        let second = allocate_connection_id();
        assert!(second > first);
    }
}
