//! Template rendering for notification payloads.
//!
//! Pure functions from a typed payload to subject and body. Because the
//! payload catalog is a closed union, rendering cannot fail for events that
//! deserialized; unrenderable events are rejected earlier, at queue decode.

use courier_core::EventPayload;

/// Rendered notification content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// Renders subject and body for a typed payload.
pub fn render(payload: &EventPayload) -> Rendered {
    match payload {
        EventPayload::UserRegistration { full_name, registration_date, kyc_status } => Rendered {
            subject: "Welcome to FinTech Bank - Account Created Successfully".to_string(),
            body: format!(
                "Dear {full_name},\n\n\
                 Welcome to FinTech Bank! Your account was created on \
                 {registration_date}.\n\n\
                 Identity verification status: {kyc_status}. Complete your KYC \
                 verification to unlock all account features.\n\n\
                 The FinTech Bank Team"
            ),
        },
        EventPayload::LoginAlert { full_name, login_time, ip_address, user_agent, device_type } => {
            Rendered {
                subject: "FinTech Bank - New Login Detected".to_string(),
                body: format!(
                    "Dear {full_name},\n\n\
                     We detected a new sign-in to your account.\n\n\
                     Time: {login_time}\n\
                     IP address: {ip_address}\n\
                     Device: {device_type}\n\
                     Browser: {user_agent}\n\n\
                     If this was you, no action is needed. If you do not \
                     recognize this activity, please secure your account \
                     immediately.\n\n\
                     The FinTech Bank Team"
                ),
            }
        },
        EventPayload::KycPending { full_name } => Rendered {
            subject: "Action Required: Complete Your KYC Verification - FinTech Bank".to_string(),
            body: format!(
                "Dear {full_name},\n\n\
                 Your identity verification is still pending. Please submit \
                 your documents to activate all features of your account.\n\n\
                 The FinTech Bank Team"
            ),
        },
        EventPayload::KycVerified { full_name, verified_date } => Rendered {
            subject: "🎉 KYC Verified! Your FinTech Bank Account is Now Active".to_string(),
            body: format!(
                "Dear {full_name},\n\n\
                 Great news! Your identity was verified on {verified_date} and \
                 your account is now fully active.\n\n\
                 The FinTech Bank Team"
            ),
        },
        EventPayload::KycRejected { full_name, reason } => Rendered {
            subject: "KYC Verification Update - FinTech Bank".to_string(),
            body: format!(
                "Dear {full_name},\n\n\
                 Unfortunately we could not verify your identity with the \
                 documents provided.\n\n\
                 Reason: {reason}\n\n\
                 Please resubmit your documents to continue.\n\n\
                 The FinTech Bank Team"
            ),
        },
        EventPayload::AccountActivated { full_name, activation_date } => Rendered {
            subject: "Your FinTech Bank Account is Active".to_string(),
            body: format!(
                "Dear {full_name},\n\n\
                 Your account was activated on {activation_date}. You now have \
                 access to all banking features.\n\n\
                 The FinTech Bank Team"
            ),
        },
        EventPayload::SecurityAlert { full_name, alert_kind, detail } => Rendered {
            subject: "Security Alert - FinTech Bank".to_string(),
            body: format!(
                "Dear {full_name},\n\n\
                 A security event was detected on your account.\n\n\
                 Event: {alert_kind}\n\
                 Details: {detail}\n\n\
                 If you do not recognize this activity, please contact support \
                 immediately.\n\n\
                 The FinTech Bank Team"
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_template_includes_name_and_date() {
        let rendered = render(&EventPayload::UserRegistration {
            full_name: "Grace Hopper".to_string(),
            registration_date: "2026-08-29".to_string(),
            kyc_status: "PENDING".to_string(),
        });

        assert_eq!(rendered.subject, "Welcome to FinTech Bank - Account Created Successfully");
        assert!(rendered.body.contains("Grace Hopper"));
        assert!(rendered.body.contains("2026-08-29"));
        assert!(rendered.body.contains("PENDING"));
    }

    #[test]
    fn login_alert_template_lists_device_context() {
        let rendered = render(&EventPayload::LoginAlert {
            full_name: "Grace Hopper".to_string(),
            login_time: "2026-08-30 08:15".to_string(),
            ip_address: "198.51.100.4".to_string(),
            user_agent: "Firefox".to_string(),
            device_type: "web".to_string(),
        });

        assert_eq!(rendered.subject, "FinTech Bank - New Login Detected");
        assert!(rendered.body.contains("198.51.100.4"));
        assert!(rendered.body.contains("Firefox"));
    }

    #[test]
    fn every_known_payload_renders_nonempty_content() {
        let payloads = vec![
            EventPayload::KycPending { full_name: "A".to_string() },
            EventPayload::KycVerified {
                full_name: "A".to_string(),
                verified_date: "2026-01-01".to_string(),
            },
            EventPayload::KycRejected {
                full_name: "A".to_string(),
                reason: "blurry document".to_string(),
            },
            EventPayload::AccountActivated {
                full_name: "A".to_string(),
                activation_date: "2026-01-01".to_string(),
            },
            EventPayload::SecurityAlert {
                full_name: "A".to_string(),
                alert_kind: "password_changed".to_string(),
                detail: "Password changed from new device".to_string(),
            },
        ];

        for payload in payloads {
            let rendered = render(&payload);
            assert!(!rendered.subject.is_empty());
            assert!(!rendered.body.is_empty());
        }
    }
}
