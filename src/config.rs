//! Process-wide network behavior options
//!
//! These options tune behaviors that cut across services
//! rather than a single association parameter.
//! An association takes a snapshot of the options when it is
//! established, so mutating a shared value afterwards
//! does not affect associations already running.

/// A predicate applied to a string value of one value representation
/// before it is sent.
pub type ValueValidator = fn(&str) -> bool;

/// Options governing the behavior of DIMSE services
/// on an association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOptions {
    /// Validate UIDs against the rules of the standard
    /// (dot-separated digit groups, up to 64 characters)
    /// before they are sent.
    pub enforce_uid_conformance: bool,
    /// Log the identifier data sets of outgoing query requests.
    pub log_request_identifiers: bool,
    /// Log the identifier data sets of incoming query responses.
    pub log_response_identifiers: bool,
    /// Strip trailing spaces from application entity titles
    /// placed in DIMSE command sets.
    pub use_short_dimse_aet: bool,
    /// Accept any abstract syntax in inbound association requests,
    /// treating unknown SOP classes as storage requests.
    pub unrestricted_storage_service: bool,
    /// Stream large data sets fragment by fragment
    /// instead of assembling each P-DATA-TF PDU in memory.
    pub chunked_transfer: bool,
    /// Extra validators applied to outgoing values,
    /// keyed by value representation.
    pub validators: Vec<(dicom_core::VR, ValueValidator)>,
}

impl NetworkOptions {
    /// Run every validator registered for the given
    /// value representation over a value.
    pub fn validate(&self, vr: dicom_core::VR, value: &str) -> bool {
        self.validators
            .iter()
            .filter(|(validator_vr, _)| *validator_vr == vr)
            .all(|(_, validator)| validator(value))
    }
}

impl Default for NetworkOptions {
    fn default() -> Self {
        NetworkOptions {
            enforce_uid_conformance: false,
            log_request_identifiers: false,
            log_response_identifiers: false,
            use_short_dimse_aet: true,
            unrestricted_storage_service: false,
            chunked_transfer: true,
            validators: Vec::new(),
        }
    }
}

/// Check a UID against the conformance rules of the standard:
/// 1 to 64 characters, digits separated by single dots,
/// no component with a leading zero unless the component is "0".
pub fn is_conformant_uid(uid: &str) -> bool {
    let uid = uid.trim_end_matches('\0');
    if uid.is_empty() || uid.len() > 64 {
        return false;
    }
    uid.split('.').all(|component| {
        !component.is_empty()
            && component.bytes().all(|b| b.is_ascii_digit())
            && (component == "0" || !component.starts_with('0'))
    })
}

/// Check an application entity title:
/// 1 to 16 printable ASCII characters, backslash excluded,
/// and not made of spaces only.
pub fn is_valid_ae_title(ae_title: &str) -> bool {
    !ae_title.trim().is_empty()
        && ae_title.len() <= 16
        && ae_title
            .bytes()
            .all(|b| (0x20..=0x7E).contains(&b) && b != b'\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_conformance() {
        assert!(is_conformant_uid("1.2.840.10008.1.1"));
        assert!(is_conformant_uid("1.2.840.10008.1.1\0"));
        assert!(is_conformant_uid("0.1.22.333"));
        assert!(!is_conformant_uid(""));
        assert!(!is_conformant_uid("1..2"));
        assert!(!is_conformant_uid("1.02.3"));
        assert!(!is_conformant_uid("1.2.abc"));
        assert!(!is_conformant_uid(&"1.2".repeat(30)));
    }

    #[test]
    fn validators_apply_per_vr() {
        let options = NetworkOptions {
            validators: vec![
                (dicom_core::VR::UI, is_conformant_uid),
                (dicom_core::VR::AE, is_valid_ae_title),
            ],
            ..NetworkOptions::default()
        };
        assert!(options.validate(dicom_core::VR::UI, "1.2.840.10008.1.1"));
        assert!(!options.validate(dicom_core::VR::UI, "not-a-uid"));
        // no validator registered for this representation
        assert!(options.validate(dicom_core::VR::PN, "anything^goes"));
    }

    #[test]
    fn ae_title_validity() {
        assert!(is_valid_ae_title("STORE-SCP"));
        assert!(is_valid_ae_title("a"));
        assert!(!is_valid_ae_title(""));
        assert!(!is_valid_ae_title("    "));
        assert!(!is_valid_ae_title("SEVENTEEN-CHARACS"));
        assert!(!is_valid_ae_title("BAD\\TITLE"));
        assert!(!is_valid_ae_title("NUL\u{0}CHAR"));
    }
}
