use fleet_runtime::{strip_ansi, MarkerPayload, OutputProcessor};

#[test]
fn fixture_marker_survives_ansi_noise() {
    let input = b"\x1b[2K\x1b[1G[CHAT_RESPONSE:abc]Hello\x1b[0m[/CHAT_RESPONSE]";
    let processor = OutputProcessor::new();
    let (_, markers) = processor.process_chunk("orchestrator", input);

    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].conversation_id.as_deref(), Some("abc"));
    match &markers[0].payload {
        MarkerPayload::ChatResponse { content } => assert_eq!(content, "Hello"),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[test]
fn fixture_orphan_csi_near_marker() {
    let input = b"about[1Cyour [CHAT_RESPONSE]m[/CHAT_RESPONSE]";
    let processor = OutputProcessor::new();
    let (cleaned, markers) = processor.process_chunk("orchestrator", input);

    assert!(cleaned.contains("about your"));
    assert_eq!(markers.len(), 1);
    match &markers[0].payload {
        MarkerPayload::ChatResponse { content } => assert_eq!(content, "m"),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[test]
fn literal_chat_response_token_survives_stripping() {
    let input = "prefix \x1b[31m[CHAT_RESPONSE]\x1b[0m body [/CHAT_RESPONSE] suffix";
    let cleaned = strip_ansi(input);
    assert!(cleaned.contains("[CHAT_RESPONSE]"));
    assert!(cleaned.contains("[/CHAT_RESPONSE]"));
}

#[test]
fn notify_header_and_body_routing_fixture() {
    let input = b"[NOTIFY]\nconversationId: c-1\nchannelId: C7\n---\n## Hi\n[/NOTIFY]";
    let processor = OutputProcessor::new();
    let (_, markers) = processor.process_chunk("orchestrator", input);

    assert_eq!(markers.len(), 1);
    match &markers[0].payload {
        MarkerPayload::Notify(fleet_runtime::NotifyBody::Header { fields, body }) => {
            assert_eq!(fields.get("channelId").map(String::as_str), Some("C7"));
            assert_eq!(body, "## Hi");
        }
        other => panic!("unexpected payload: {other:?}"),
    }
    assert_eq!(markers[0].conversation_id.as_deref(), Some("c-1"));
}

#[test]
fn reframing_invariance_across_chunk_splits() {
    let whole: &[u8] = b"noise [CHAT_RESPONSE:c1]first[/CHAT_RESPONSE] more [CHAT_RESPONSE:c2]second[/CHAT_RESPONSE]";

    for split_at in 0..whole.len() {
        let (a, b) = whole.split_at(split_at);
        let processor = OutputProcessor::new();
        let (_, mut markers) = processor.process_chunk("s", a);
        let (_, rest) = processor.process_chunk("s", b);
        markers.extend(rest);

        let ids: Vec<_> = markers.iter().filter_map(|m| m.conversation_id.clone()).collect();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()], "split at {split_at}");
    }
}
