//! End-to-end scenarios from the testable-properties table: file ingest through HL7-to-FHIR
//! transform to HTTP egress (S3), validation rejection (S2), MLLP reconnect-then-deliver (S4),
//! and dead-letter after max retries against a failing FHIR sink (S5).

use interop_core::config::EngineConfig;
use interop_core::envelope::{Body, BodyContent, Envelope, Header};
use interop_core::queue::{Queue, QueueConfig, QueueManager};
use interop_pipeline::processors::{TransformationProcessor, ValidationProcessor};
use interop_pipeline::senders::{FhirAuth, FhirSender};
use interop_pipeline::stage::Stage;
use interop_pipeline::Orchestrator;
use interop_transform::TransformationRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// S3: a file dropped in the watch directory is ingested, validated, transformed from
/// `ADT^A01` into a FHIR `Patient`, and delivered to the HTTP sink.
#[tokio::test]
async fn s3_file_ingest_transforms_to_patient_and_reaches_http_sink() {
    let tmp = tempfile::tempdir().unwrap();
    let watch_dir = tmp.path().join("in");
    tokio::fs::create_dir_all(&watch_dir).await.unwrap();
    let raw = b"MSH|^~\\&|A|B|C|D|20230629120000||ADT^A01|MSG00003|P|2.3\rEVN|A01|20230629120000\rPID|1||10020||Doe^Jane||19800101|F\r";
    tokio::fs::write(watch_dir.join("patient.hl7"), raw).await.unwrap();

    let bytes = tokio::fs::read(watch_dir.join("patient.hl7")).await.unwrap();
    let parsed = interop_hl7::parse_message(&bytes).unwrap();
    let header = Header::new(
        parsed.message_type().unwrap_or_default().to_string(),
        "application/hl7-v2+er7",
        format!("file://{}", watch_dir.display()),
    );
    let mut body = Body::from_raw("application/hl7-v2+er7", bytes);
    body.content = BodyContent::Hl7(interop_hl7::flatten(&parsed));
    let ingested = Envelope::new(header, body);

    let queues = QueueManager::<Envelope>::new(QueueConfig::default());
    let raw_queue = queues.queue("raw_messages").await;
    let validated_queue = queues.queue("validated_messages").await;
    let transformed_queue = queues.queue("transformed_messages").await;
    let validation_errors = queues.queue("validation_errors").await;
    let transformation_errors = queues.queue("transformation_errors").await;
    raw_queue.publish(ingested).await.unwrap();

    let validation_stage = Arc::new(Stage::new(
        "validation",
        raw_queue.clone(),
        Some(validated_queue.clone()),
        validation_errors.clone(),
        Arc::new(ValidationProcessor),
        5,
        Duration::from_secs(1),
    ));
    validation_stage.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    validation_stage.stop().await.unwrap();
    assert_eq!(validated_queue.len().await, 1);

    let mut registry = TransformationRegistry::new();
    for (_, rule) in interop_transform::default_rules() {
        registry.register(rule);
    }
    let transformation_stage = Arc::new(Stage::new(
        "transformation",
        validated_queue.clone(),
        Some(transformed_queue.clone()),
        transformation_errors.clone(),
        Arc::new(TransformationProcessor { registry: Arc::new(registry) }),
        5,
        Duration::from_secs(1),
    ));
    transformation_stage.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    transformation_stage.stop().await.unwrap();
    assert_eq!(transformation_errors.len().await, 0);
    assert_eq!(transformed_queue.len().await, 1);

    let (_, transformed) = transformed_queue.consume().await.unwrap().unwrap();
    let fhir_body = match &transformed.body.content {
        BodyContent::Fhir(value) => value.clone(),
        other => panic!("expected a FHIR body, got {other:?}"),
    };
    assert_eq!(fhir_body["resourceType"], "Patient");
    assert_eq!(fhir_body["name"][0]["family"], "Doe");
    assert_eq!(fhir_body["gender"], "female");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received_body = Arc::new(Mutex::new(None));
    let received_body_clone = Arc::clone(&received_body);
    let server_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let n = stream.read(&mut buf).await.unwrap();
        let request = String::from_utf8_lossy(&buf[..n]);
        let body_start = request.find("\r\n\r\n").unwrap() + 4;
        *received_body_clone.lock().await = Some(request[body_start..].to_string());
        let response_body = b"{\"resourceType\":\"Patient\",\"id\":\"10020\"}";
        let response = format!(
            "HTTP/1.1 201 Created\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n",
            response_body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.write_all(response_body).await.unwrap();
    });

    let sender = FhirSender::new(format!("http://{addr}"), FhirAuth::None);
    sender.send(&transformed).await.unwrap();
    server_task.await.unwrap();

    let captured = received_body.lock().await.clone().unwrap();
    assert!(captured.contains("\"family\":\"Doe\""));
}

fn adt_a01_missing_pid() -> Envelope {
    let raw = b"MSH|^~\\&|A|B|C|D|20230629120000||ADT^A01|MSG00002|P|2.3\rEVN|A01|20230629120000\r";
    let parsed = interop_hl7::parse_message(raw).unwrap();
    let flat = interop_hl7::flatten(&parsed);
    let header = Header::new("ADT^A01", "application/hl7-v2+er7", "mllp://inbound");
    let mut body = Body::from_raw("application/hl7-v2+er7", raw.to_vec());
    body.content = BodyContent::Hl7(flat);
    Envelope::new(header, body)
}

/// S2: a message missing its required PID segment lands in the validation error queue with the
/// expected error text, rather than being forwarded.
#[tokio::test]
async fn s2_validation_rejection_lands_in_error_queue() {
    let queues = QueueManager::<Envelope>::new(QueueConfig::default());
    let input = queues.queue("raw_messages").await;
    let output = queues.queue("validated_messages").await;
    let errors = queues.queue("validation_errors").await;
    input.publish(adt_a01_missing_pid()).await.unwrap();

    let stage = Arc::new(Stage::new(
        "validation",
        input.clone(),
        Some(output.clone()),
        errors.clone(),
        Arc::new(ValidationProcessor),
        5,
        Duration::from_secs(1),
    ));
    stage.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stage.stop().await.unwrap();

    assert_eq!(output.len().await, 0);
    assert_eq!(errors.len().await, 1);
    let (_, envelope) = errors.consume().await.unwrap().unwrap();
    let recorded = envelope.header.metadata.get("errors").unwrap();
    let message = recorded[0]["message"].as_str().unwrap();
    assert!(message.contains("Missing required segment: PID"));
}

/// S4: the MLLP client's first connection attempt is refused; the orchestrator's sender loop
/// requeues with an incremented `retry_count`, and the second attempt succeeds, delivering the
/// message with no duplicate sent to the sink.
#[tokio::test]
async fn s4_mllp_sender_reconnects_after_refused_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Close the listener immediately so the first connect attempt is refused, then rebind the
    // same port for the real acceptor.
    drop(listener);

    let accept_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let accept_count_clone = Arc::clone(&accept_count);
    let server_task = tokio::spawn(async move {
        // Give the sender a moment to try (and fail) its first connect before we start listening.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        let payload = interop_hl7::mllp::decode(&buf[..n]).unwrap();
        let msg = interop_hl7::parse_message(payload).unwrap();
        let ack = interop_hl7::mllp::build_ack(&msg, "MSG00001");
        stream.write_all(&interop_hl7::mllp::encode(ack.as_bytes())).await.unwrap();
    });

    let yaml = format!(
        "outbound:\n  mllp:\n    - name: test_mllp\n      host: {}\n      port: {}\n      input_queue: outbound_mllp_messages\n      error_queue: outbound_mllp_errors\n      max_retries: 5\n",
        addr.ip(),
        addr.port()
    );
    let config = EngineConfig::from_yaml_str(&yaml, None).unwrap();
    let mut orchestrator = Orchestrator::build(&config).await.unwrap();
    orchestrator.start(&config).await.unwrap();

    let raw = b"MSH|^~\\&|A|B|C|D||ADT^A01|MSG00001|P|2.3\r";
    let header = Header::new("ADT^A01", "application/hl7-v2+er7", "test://");
    let body = Body::from_raw("application/hl7-v2+er7", raw.to_vec());
    let envelope = Envelope::new(header, body);
    let input = orchestrator.queues().queue("outbound_mllp_messages").await;
    let errors = orchestrator.queues().queue("outbound_mllp_errors").await;
    input.publish(envelope).await.unwrap();

    server_task.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator.stop().await;

    assert_eq!(accept_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(errors.len().await, 0);
}

/// S5: a FHIR sink that always returns 500 dead-letters after exactly `max_retries` real HTTP
/// requests, with exactly `max_retries` `server_5xx` error entries accumulated on the envelope.
#[tokio::test]
async fn s5_dead_letter_after_max_retries_against_failing_fhir_sink() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let request_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let request_count_clone = Arc::clone(&request_count);

    let server_task = tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            request_count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let body = b"{}";
            let response = format!(
                "HTTP/1.1 500 Internal Server Error\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.write_all(body).await;
        }
    });

    let max_retries = 3;
    let yaml = format!(
        "outbound:\n  fhir:\n    - name: test_fhir\n      base_url: http://{addr}\n      input_queue: outbound_fhir_messages\n      error_queue: outbound_fhir_errors\n      max_retries: {max_retries}\n"
    );
    let config = EngineConfig::from_yaml_str(&yaml, None).unwrap();
    let mut orchestrator = Orchestrator::build(&config).await.unwrap();
    orchestrator.start(&config).await.unwrap();

    let header = Header::new("Patient", "application/fhir+json", "test://");
    let mut body = Body::from_raw("application/fhir+json", Vec::new());
    body.content = BodyContent::Fhir(serde_json::json!({ "resourceType": "Patient", "id": "1" }));
    let envelope = Envelope::new(header, body);
    let input = orchestrator.queues().queue("outbound_fhir_messages").await;
    let errors = orchestrator.queues().queue("outbound_fhir_errors").await;
    input.publish(envelope).await.unwrap();

    // Give the sender loop time to exhaust its retries against the always-failing sink.
    tokio::time::sleep(Duration::from_millis(500)).await;
    orchestrator.stop().await;
    server_task.abort();

    assert_eq!(errors.len().await, 1);
    let (_, dead_lettered) = errors.consume().await.unwrap().unwrap();
    assert_eq!(dead_lettered.header.retry_count, max_retries);
    let recorded = dead_lettered.header.metadata.get("errors").unwrap().as_array().unwrap();
    assert_eq!(recorded.len(), max_retries as usize);
    for entry in recorded {
        assert_eq!(entry["kind"].as_str().unwrap(), "Server5xx");
    }

    assert_eq!(request_count.load(std::sync::atomic::Ordering::SeqCst), max_retries as usize);
}
