mod common;

use session_gateway::hub::EnsureRuntimeOptions;
use session_gateway::policy::PromptDispatch;
use session_gateway::session::{ClientType, Session};

use common::Harness;

fn with_prompt(id: &str) -> Session {
    Session::new(id, ClientType::Interactive).with_initial_prompt("Summarize the open issues.")
}

#[tokio::test]
async fn prompt_is_sent_once_across_bring_ups() {
    let harness = Harness::new();
    let hub = harness.hub(with_prompt("ses_prompt"));

    hub.ensure_runtime_ready(EnsureRuntimeOptions::default())
        .await
        .expect("ready");
    assert_eq!(
        harness.conversation.delivered(),
        vec![(
            "ses_prompt".to_string(),
            "Summarize the open issues.".to_string()
        )]
    );
    assert!(harness
        .persistence
        .session("ses_prompt")
        .expect("session")
        .initial_prompt_sent_at
        .is_some());

    let again = hub.maybe_send_initial_prompt().await.expect("second");
    assert_eq!(again, PromptDispatch::AlreadySent);
    assert_eq!(harness.conversation.attempts(), 1);
}

#[tokio::test]
async fn failed_delivery_rolls_back_marker_and_retries() {
    let harness = Harness::new();
    harness.conversation.fail_next(1);
    let hub = harness.hub(with_prompt("ses_retry"));

    // Delivery failure does not fail bring-up.
    hub.ensure_runtime_ready(EnsureRuntimeOptions::default())
        .await
        .expect("ready");
    assert!(hub.is_runtime_ready());
    assert!(harness.conversation.delivered().is_empty());
    assert!(hub.context().session().initial_prompt_sent_at.is_none());
    assert!(harness
        .persistence
        .session("ses_retry")
        .expect("session")
        .initial_prompt_sent_at
        .is_none());

    let dispatch = hub.maybe_send_initial_prompt().await.expect("retry");
    assert_eq!(dispatch, PromptDispatch::Sent);
    assert_eq!(harness.conversation.delivered().len(), 1);
    assert_eq!(harness.conversation.attempts(), 2);

    let marker_writes: Vec<bool> = harness
        .persistence
        .session_writes("ses_retry")
        .into_iter()
        .filter_map(|patch| patch.initial_prompt_sent_at)
        .map(|sent_at| sent_at.is_some())
        .collect();
    assert_eq!(marker_writes, vec![true, false, true]);
    assert_eq!(
        hub.context().session().initial_prompt_sent_at,
        harness
            .persistence
            .session("ses_retry")
            .expect("session")
            .initial_prompt_sent_at
    );
}

#[tokio::test]
async fn direct_dispatch_reports_delivery_error() {
    let harness = Harness::new();
    harness.conversation.fail_next(1);
    let hub = harness.hub(with_prompt("ses_direct"));
    hub.ensure_runtime_ready(EnsureRuntimeOptions {
        skip_initial_prompt: true,
    })
    .await
    .expect("ready");
    assert_eq!(harness.conversation.attempts(), 0);

    hub.maybe_send_initial_prompt()
        .await
        .expect_err("delivery error surfaces");
    assert!(hub.context().session().initial_prompt_sent_at.is_none());
}

#[tokio::test]
async fn concurrent_dispatch_delivers_once() {
    let harness = Harness::new();
    let hub = harness.hub(with_prompt("ses_race"));
    hub.ensure_runtime_ready(EnsureRuntimeOptions {
        skip_initial_prompt: true,
    })
    .await
    .expect("ready");

    let (first, second) = tokio::join!(
        hub.maybe_send_initial_prompt(),
        hub.maybe_send_initial_prompt()
    );
    let mut outcomes = vec![first.expect("first"), second.expect("second")];
    outcomes.sort_by_key(|dispatch| *dispatch != PromptDispatch::Sent);

    assert_eq!(outcomes[0], PromptDispatch::Sent);
    assert!(matches!(
        outcomes[1],
        PromptDispatch::InProgress | PromptDispatch::AlreadySent
    ));
    assert_eq!(harness.conversation.delivered().len(), 1);
}

#[tokio::test]
async fn session_without_prompt_is_left_alone() {
    let harness = Harness::new();
    let hub = harness.hub(Session::new("ses_plain", ClientType::Interactive));
    hub.ensure_runtime_ready(EnsureRuntimeOptions::default())
        .await
        .expect("ready");

    assert_eq!(
        hub.maybe_send_initial_prompt().await.expect("dispatch"),
        PromptDispatch::NotConfigured
    );
    assert_eq!(harness.conversation.attempts(), 0);
}

#[tokio::test]
async fn prompt_is_not_resent_after_handoff_to_a_peer() {
    let harness = Harness::new();
    harness.insert_session(with_prompt("ses_handoff"));
    let peer = harness.peer("gw-b");
    let first = harness.services_with(Vec::new());
    let second = peer.services_with(Vec::new());

    // The peer caches its view before the owner sends the prompt.
    let waiting = second.hubs.get_or_create("ses_handoff").await.expect("peer hub");
    let owner = first.hubs.get_or_create("ses_handoff").await.expect("owner hub");
    owner
        .ensure_runtime_ready(EnsureRuntimeOptions::default())
        .await
        .expect("owner ready");
    assert_eq!(harness.conversation.delivered().len(), 1);
    first.shutdown().await;

    waiting
        .ensure_runtime_ready(EnsureRuntimeOptions::default())
        .await
        .expect("takeover");

    assert_eq!(harness.conversation.delivered().len(), 1);
    assert_eq!(harness.conversation.attempts(), 1);
    assert_eq!(
        waiting.context().session().initial_prompt_sent_at,
        harness
            .persistence
            .session("ses_handoff")
            .expect("session")
            .initial_prompt_sent_at
    );
    second.shutdown().await;
}
