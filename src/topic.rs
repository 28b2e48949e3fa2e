/// Placeholder recognised in the base topic template.
pub const CLIENT_ID_TOKEN: &str = "client_id";

/// Resolve the publish topic for the currently selected client.
///
/// Without an active client id the template is returned as-is. Otherwise the first
/// `client_id` token is substituted; nothing else in the template is interpreted.
pub fn resolve(base: &str, active_client_id: Option<&str>) -> String {
    match active_client_id {
        Some(id) if !id.is_empty() => base.replacen(CLIENT_ID_TOKEN, id, 1),
        _ => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_client_returns_template() {
        assert_eq!(resolve("/client_id/api", None), "/client_id/api");
        assert_eq!(resolve("/client_id/api", Some("")), "/client_id/api");
    }

    #[test]
    fn substitutes_placeholder() {
        assert_eq!(resolve("/client_id/api", Some("tenant42")), "/tenant42/api");
    }

    #[test]
    fn substitutes_only_first_occurrence() {
        assert_eq!(
            resolve("client_id/client_id/api", Some("t1")),
            "t1/client_id/api"
        );
    }

    #[test]
    fn template_without_placeholder_passes_through() {
        assert_eq!(resolve("devices/#bad topic", Some("t1")), "devices/#bad topic");
    }
}
