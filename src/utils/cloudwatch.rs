//! AWS attribute derivation from CloudWatch Logs group and stream names.

use crate::record::{AttrMap, AttrValue};

// Log streams of an EKS control plane carry one of these prefixes; the
// audit stream must be checked before the plain api-server prefix.
const EKS_LOG_STREAM_SOURCES: &[&str] = &[
    "kube-apiserver-audit",
    "kube-apiserver",
    "authenticator",
    "kube-controller-manager",
    "kube-scheduler",
];

/// Derives `aws.service`, `aws.resource.id` and `log.source` from a
/// CloudWatch Logs group/stream pair.
///
/// Log group names follow `/aws/<service>/<resource>/...`; the service
/// segment drives a small per-service table (EKS additionally maps the
/// stream name onto the control-plane component emitting it).
pub fn attributes_from_cloudwatch_logs(log_group: &str, log_stream: &str) -> AttrMap {
    let mut attributes = AttrMap::new();

    let segments: Vec<&str> = log_group.split('/').collect();
    let Some(service) = segments.get(2).copied() else {
        return attributes;
    };
    attributes.insert("aws.service".to_string(), AttrValue::from(service));

    match service {
        "eks" => {
            if let Some(resource_id) = segments.get(3) {
                attributes.insert("aws.resource.id".to_string(), AttrValue::from(*resource_id));
            }
            let source = EKS_LOG_STREAM_SOURCES
                .iter()
                .find(|prefix| log_stream.contains(*prefix))
                .copied()
                .unwrap_or("");
            attributes.insert("log.source".to_string(), AttrValue::from(source));
        }
        "lambda" => {
            if let Some(resource_id) = segments.get(3) {
                attributes.insert("aws.resource.id".to_string(), AttrValue::from(*resource_id));
            }
        }
        _ => {}
    }

    attributes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eks_cluster_attributes() {
        let attributes = attributes_from_cloudwatch_logs(
            "/aws/eks/cluster-X/cluster",
            "kube-apiserver-abc123",
        );
        assert_eq!(
            attributes.get("aws.service"),
            Some(&AttrValue::from("eks"))
        );
        assert_eq!(
            attributes.get("aws.resource.id"),
            Some(&AttrValue::from("cluster-X"))
        );
        assert_eq!(
            attributes.get("log.source"),
            Some(&AttrValue::from("kube-apiserver"))
        );
    }

    #[test]
    fn test_eks_audit_stream_beats_apiserver_prefix() {
        let attributes = attributes_from_cloudwatch_logs(
            "/aws/eks/my_cluster/cluster",
            "kube-apiserver-audit-1234567890abcdef",
        );
        assert_eq!(
            attributes.get("log.source"),
            Some(&AttrValue::from("kube-apiserver-audit"))
        );
    }

    #[test]
    fn test_lambda_attributes() {
        let attributes = attributes_from_cloudwatch_logs(
            "/aws/lambda/hello-world-123",
            "2023/02/14/[$LATEST]6c9e8a41",
        );
        assert_eq!(
            attributes.get("aws.service"),
            Some(&AttrValue::from("lambda"))
        );
        assert_eq!(
            attributes.get("aws.resource.id"),
            Some(&AttrValue::from("hello-world-123"))
        );
        assert_eq!(attributes.get("log.source"), None);
    }

    #[test]
    fn test_unknown_service_only_sets_service() {
        let attributes =
            attributes_from_cloudwatch_logs("/aws/rds/instance-1/error", "stream");
        assert_eq!(
            attributes.get("aws.service"),
            Some(&AttrValue::from("rds"))
        );
        assert_eq!(attributes.get("aws.resource.id"), None);
    }

    #[test]
    fn test_short_log_group_yields_nothing() {
        let attributes = attributes_from_cloudwatch_logs("flat", "stream");
        assert!(attributes.is_empty());
    }
}
