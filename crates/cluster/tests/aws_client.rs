//! Integration tests for the HTTP AWS client.
//!
//! These tests run the client against a local mock server standing in for the
//! CloudFormation, EC2 and S3 endpoints.

use hpc_cluster::aws::{CfnClient, Ec2Client, Filter, S3Client};
use hpc_cluster::{Aws, AwsApi, BucketSettings, Cluster, StackStatus};
use serde_json::json;
use wiremock::matchers::{body_string, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Helpers
// =============================================================================

fn client(server: &MockServer) -> Aws {
    Aws::new("us-east-1")
        .unwrap()
        .with_endpoint(format!("{}/", server.uri()))
}

fn stack_body(status: &str) -> serde_json::Value {
    json!({
        "DescribeStacksResponse": {
            "DescribeStacksResult": {
                "Stacks": [{
                    "StackName": "my-cluster",
                    "StackId": "arn:aws:cloudformation:us-east-1:123:stack/my-cluster/abc",
                    "StackStatus": status,
                    "CreationTime": "2024-01-01T00:00:00Z",
                    "Tags": [
                        {"Key": "hpc-cluster:version", "Value": "1.0.0"},
                        {"Key": "hpc-cluster:cluster-dir", "Value": "hpc-cluster/clusters/my-cluster-1"}
                    ]
                }]
            }
        }
    })
}

async fn mount_action(server: &MockServer, action: &str, body: serde_json::Value, times: u64) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_string_contains(format!("Action={action}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(times)
        .mount(server)
        .await;
}

// =============================================================================
// CloudFormation
// =============================================================================

#[tokio::test]
async fn test_describe_stack() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeStacks"))
        .and(body_string_contains("StackName=my-cluster"))
        .and(header("X-Amz-Access-Key-Id", "AKIDEXAMPLE"))
        .respond_with(ResponseTemplate::new(200).set_body_json(stack_body("UPDATE_COMPLETE")))
        .expect(1)
        .mount(&server)
        .await;

    let stack = client(&server)
        .with_access_key("AKIDEXAMPLE")
        .describe_stack("my-cluster")
        .await
        .unwrap();

    assert_eq!(stack.stack_name, "my-cluster");
    assert_eq!(stack.stack_status, StackStatus::UpdateComplete);
    assert_eq!(stack.tag("hpc-cluster:version"), Some("1.0.0"));
}

#[tokio::test]
async fn test_describe_missing_stack() {
    let server = MockServer::start().await;
    mount_action(
        &server,
        "DescribeStacks",
        json!({"DescribeStacksResponse": {"DescribeStacksResult": {"Stacks": []}}}),
        1,
    )
    .await;

    let err = client(&server).describe_stack("gone").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.message, "Stack with id gone does not exist");
}

#[tokio::test]
async fn test_get_stack_template() {
    let server = MockServer::start().await;
    mount_action(
        &server,
        "GetTemplate",
        json!({"GetTemplateResponse": {"GetTemplateResult": {"TemplateBody": "{\"Resources\": {}}"}}}),
        1,
    )
    .await;

    let body = client(&server).get_stack_template("my-cluster").await.unwrap();
    assert_eq!(body.as_deref(), Some("{\"Resources\": {}}"));
}

#[tokio::test]
async fn test_update_without_changes_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=UpdateStack"))
        .and(body_string_contains("Capabilities.member.2=CAPABILITY_NAMED_IAM"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "Error": {"Code": "ValidationError", "Message": "No updates are to be performed."}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .update_stack_from_url("my-cluster", "https://bucket.s3.us-east-1.amazonaws.com/t.yaml")
        .await
        .unwrap_err();

    assert!(err.is_no_update());
    assert_eq!(err.code.as_deref(), Some("ValidationError"));
    assert_eq!(err.function_name, "update_stack_from_url");
}

#[tokio::test]
async fn test_access_denied() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let err = client(&server).delete_stack("my-cluster").await.unwrap_err();
    assert_eq!(err.message, "Access denied: forbidden");
}

// =============================================================================
// EC2
// =============================================================================

#[tokio::test]
async fn test_describe_instances_flattens_reservations() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DescribeInstances"))
        .and(body_string_contains("Filter.1.Name=tag%3Ahpc-cluster%3Anode-type"))
        .and(body_string_contains("Filter.1.Value.1=Compute"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Reservations": [
                {"Instances": [
                    {"InstanceId": "i-1", "InstanceType": "c5.xlarge", "State": {"Code": 16, "Name": "running"}}
                ]},
                {"Instances": [
                    {"InstanceId": "i-2", "InstanceType": "c5.xlarge", "State": {"Code": 0, "Name": "pending"},
                     "PrivateIpAddress": "10.0.0.2"}
                ]}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let instances = client(&server)
        .describe_instances(vec![Filter::tag("hpc-cluster:node-type", "Compute")])
        .await
        .unwrap();

    let ids: Vec<&str> = instances.iter().map(|i| i.instance_id.as_str()).collect();
    assert_eq!(ids, ["i-1", "i-2"]);
    assert_eq!(instances[1].private_ip_address.as_deref(), Some("10.0.0.2"));
}

#[tokio::test]
async fn test_terminate_instances() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=TerminateInstances"))
        .and(body_string_contains("InstanceId.1=i-1&InstanceId.2=i-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .terminate_instances(vec!["i-1".to_string(), "i-2".to_string()])
        .await
        .unwrap();
}

// =============================================================================
// S3
// =============================================================================

#[tokio::test]
async fn test_put_object() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/bucket/dir/templates/t.yaml"))
        .and(body_string("{}"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .put_object("bucket", "dir/templates/t.yaml", "{}".to_string())
        .await
        .unwrap();
}

// =============================================================================
// Controller over HTTP
// =============================================================================

#[tokio::test]
async fn test_delete_cluster_without_logs() {
    let server = MockServer::start().await;
    mount_action(&server, "DescribeStacks", stack_body("CREATE_COMPLETE"), 1).await;
    mount_action(&server, "DescribeInstances", json!({"Reservations": []}), 1).await;
    mount_action(&server, "DeleteStack", json!({}), 1).await;
    mount_action(&server, "GetTemplate", json!({}), 0).await;

    let settings = BucketSettings {
        name: "bucket".to_string(),
        region: "us-east-1".to_string(),
    };
    let mut cluster = Cluster::load("my-cluster", AwsApi::from_client(client(&server)), &settings)
        .await
        .unwrap();

    assert_eq!(
        cluster.bucket().artifact_directory(),
        "hpc-cluster/clusters/my-cluster-1"
    );
    cluster.delete(false).await.unwrap();
    assert_eq!(cluster.stack().status(), &StackStatus::DeleteInProgress);
}
