//! Topic definitions

/// Topic patterns, all scoped by a namespace
pub struct Topics;

const RUN_LOGS: &str = "run-logs";
const BUILD_LOGS: &str = "build-logs";

impl Topics {
    /// Live container output of a resource
    pub fn run_logs(namespace: &str, resource_id: &str) -> String {
        format!("{}.{}.{}", namespace, RUN_LOGS, resource_id)
    }

    /// Build progress of a resource
    pub fn build_logs(namespace: &str, resource_id: &str) -> String {
        format!("{}.{}.{}", namespace, BUILD_LOGS, resource_id)
    }

    fn parse(topic: &str, kind: &str) -> Option<String> {
        let marker = format!(".{}.", kind);
        let (_, id) = topic.split_once(&marker)?;
        (!id.is_empty()).then(|| id.to_string())
    }

    /// Parse a run-log topic to extract the resource ID
    pub fn parse_run_logs(topic: &str) -> Option<String> {
        Self::parse(topic, RUN_LOGS)
    }

    /// Parse a build-log topic to extract the resource ID
    pub fn parse_build_logs(topic: &str) -> Option<String> {
        Self::parse(topic, BUILD_LOGS)
    }
}
