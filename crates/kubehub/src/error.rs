use fakelet_core::ClientError;

/// Map a kube error onto the retry taxonomy the controllers understand.
pub fn classify(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(resp) => {
            let msg = if resp.reason.is_empty() { resp.message } else { format!("{}: {}", resp.reason, resp.message) };
            match resp.code {
                404 | 410 => ClientError::NotFound(msg),
                409 => ClientError::Conflict(msg),
                429 => ClientError::Throttled(msg),
                500..=599 => ClientError::Transient(msg),
                _ => ClientError::Invalid(msg),
            }
        }
        kube::Error::SerdeError(e) => ClientError::Invalid(e.to_string()),
        other => ClientError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: "Reason".into(),
            code,
        })
    }

    #[test]
    fn status_codes() {
        assert!(classify(api(404)).is_not_found());
        assert_eq!(classify(api(409)), ClientError::Conflict("Reason: boom".into()));
        assert!(matches!(classify(api(429)), ClientError::Throttled(_)));
        assert!(matches!(classify(api(503)), ClientError::Transient(_)));
        let invalid = classify(api(422));
        assert!(matches!(invalid, ClientError::Invalid(_)));
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn decode_failures_are_not_retried() {
        let e = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!classify(kube::Error::SerdeError(e)).is_retryable());
    }
}
