use std::{collections::HashSet, sync::Arc};

use futures_util::future::join_all;
use handoff_server::{
    app::AppState,
    types::{Actor, ConfidenceAssessment, Conversation, EscalationAction, MessageDraft, TicketStatus},
};

async fn setup() -> (Arc<AppState>, Conversation) {
    let state = Arc::new(AppState::in_memory());
    let conversation = state
        .conversations
        .create(&Actor::customer("cust-1"), None)
        .await
        .unwrap();
    (state, conversation)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_escalations_leave_one_active_ticket() {
    let (state, conversation) = setup().await;

    let mut handles = Vec::new();
    for n in 0..16 {
        let state = state.clone();
        let id = conversation.id.clone();
        handles.push(tokio::spawn(async move {
            if n % 2 == 0 {
                let escalation = state
                    .escalation
                    .escalate_now(&id, &Actor::customer("cust-1"), None, None)
                    .await
                    .unwrap();
                (escalation.ticket.id, escalation.created)
            } else {
                let decision = state
                    .escalation
                    .evaluate(&id, &format!("m-{n}"), Ok(ConfidenceAssessment::scored(0.1)))
                    .await
                    .unwrap();
                let ticket = decision.ticket.unwrap();
                (ticket.id, decision.reason == handoff_server::escalation::DecisionReason::LowConfidence)
            }
        }));
    }

    let results = join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect::<Vec<_>>();
    let ids = results.iter().map(|(id, _)| id.clone()).collect::<HashSet<_>>();
    assert_eq!(ids.len(), 1);
    assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);

    let boundary = state
        .conversations
        .since(&conversation.id, 0, None)
        .await
        .unwrap();
    assert_eq!(boundary.len(), 1, "only the creator announces the ticket");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_get_gapless_sequences() {
    let (state, conversation) = setup().await;

    let mut handles = Vec::new();
    for producer in 0..8 {
        let state = state.clone();
        let id = conversation.id.clone();
        handles.push(tokio::spawn(async move {
            for n in 0..25 {
                let draft = if producer % 2 == 0 {
                    MessageDraft::customer(format!("p{producer}-{n}"))
                } else {
                    MessageDraft::agent(format!("agent-{producer}"), format!("p{producer}-{n}"))
                };
                state.conversations.append(&id, draft).await.unwrap();
            }
        }));
    }
    for handle in join_all(handles).await {
        handle.unwrap();
    }

    let messages = state
        .conversations
        .since(&conversation.id, 0, None)
        .await
        .unwrap();
    let sequences = messages.iter().map(|m| m.sequence).collect::<Vec<_>>();
    assert_eq!(sequences, (1..=200).collect::<Vec<i64>>());

    let stored = state.conversations.get(&conversation.id).await.unwrap();
    assert_eq!(stored.last_sequence, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn raced_scores_map_to_none_offer_auto_with_one_ticket() {
    for _ in 0..20 {
        let (state, conversation) = setup().await;

        let evaluations = [0.9, 0.5, 0.2].map(|score| {
            let state = state.clone();
            let id = conversation.id.clone();
            tokio::spawn(async move {
                state
                    .escalation
                    .evaluate(&id, &format!("ai-{score}"), Ok(ConfidenceAssessment::scored(score)))
                    .await
                    .unwrap()
            })
        });
        let decisions = join_all(evaluations)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect::<Vec<_>>();

        assert_eq!(
            decisions.iter().map(|d| d.action).collect::<Vec<_>>(),
            vec![EscalationAction::None, EscalationAction::Offer, EscalationAction::Auto]
        );
        let page = state
            .sync
            .list_tickets(
                &Actor::agent("a-1"),
                &Default::default(),
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_responses_leave_one_owner() {
    let (state, conversation) = setup().await;
    let ticket = state
        .escalation
        .escalate_now(&conversation.id, &Actor::customer("cust-1"), None, None)
        .await
        .unwrap()
        .ticket;

    let responses = ["agent-a", "agent-b"].map(|agent| {
        let state = state.clone();
        let ticket_id = ticket.id.clone();
        tokio::spawn(async move {
            state
                .tickets
                .respond(&ticket_id, &format!("hello from {agent}"), &Actor::agent(agent), None)
                .await
                .unwrap()
        })
    });
    let responses = join_all(responses)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect::<Vec<_>>();

    assert_eq!(responses.iter().filter(|r| r.claimed).count(), 1);
    let owner = responses
        .iter()
        .find(|r| r.claimed)
        .and_then(|r| r.ticket.agent_id.clone())
        .unwrap();

    let stored = state.sync.get_ticket(&Actor::admin("root"), &ticket.id).await.unwrap();
    assert_eq!(stored.agent_id, Some(owner));
    assert_eq!(stored.status, TicketStatus::InProgress);

    let agent_messages = state
        .conversations
        .since(&conversation.id, 0, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.sender.kind() == "agent")
        .map(|m| m.sequence)
        .collect::<Vec<_>>();
    assert_eq!(agent_messages.len(), 2);
    assert!(agent_messages[0] < agent_messages[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_idempotency_key_stores_one_message() {
    let (state, conversation) = setup().await;

    let attempts = (0..6).map(|_| {
        let state = state.clone();
        let id = conversation.id.clone();
        tokio::spawn(async move {
            state
                .conversations
                .append(
                    &id,
                    MessageDraft::customer("where is my refund?")
                        .with_key(Some("4f1c9d5e-3c1b-4a7e-9f0e-1d2c3b4a5f6e".to_string())),
                )
                .await
                .unwrap()
        })
    });
    let appended = join_all(attempts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect::<Vec<_>>();

    assert_eq!(appended.iter().filter(|a| a.created).count(), 1);
    let first = &appended[0].message;
    assert!(appended.iter().all(|a| &a.message == first));
    assert_eq!(
        state
            .conversations
            .since(&conversation.id, 0, None)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn since_zero_replays_the_whole_log_in_order() {
    let (state, conversation) = setup().await;
    for n in 1..=10 {
        state
            .conversations
            .append(&conversation.id, MessageDraft::customer(format!("message {n}")))
            .await
            .unwrap();
    }

    let messages = state
        .conversations
        .since(&conversation.id, 0, None)
        .await
        .unwrap();
    assert_eq!(
        messages.iter().map(|m| m.sequence).collect::<Vec<_>>(),
        (1..=10).collect::<Vec<i64>>()
    );
    assert_eq!(messages[9].content, "message 10");
}
