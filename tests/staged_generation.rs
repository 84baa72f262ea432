use serde_json::{json, Value};
use staged_generation::{
    ContextStore, ExecCtx, GenerationMode, InMemoryConfigStore, InMemoryContextStore,
    MockBackend, PipelineScheduler, SavedContextEntry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Answers `R(<task>)` for classic prompts and `R(<message>)` otherwise.
fn echo() -> MockBackend {
    MockBackend::from_fn(|req| {
        let content = req.last_user_content().unwrap_or_default();
        let task = content.rsplit("Задача: ").next().unwrap_or_default();
        Ok(format!("R({})", task))
    })
}

struct Harness {
    scheduler: PipelineScheduler,
    configs: Arc<InMemoryConfigStore>,
    contexts: Arc<InMemoryContextStore>,
    mock: Arc<MockBackend>,
}

impl Harness {
    fn new(mock: MockBackend) -> Self {
        let mock = Arc::new(mock);
        let ctx = Arc::new(ExecCtx::builder("http://mock").backend(mock.clone()).build());
        let configs = Arc::new(InMemoryConfigStore::new());
        let contexts = Arc::new(InMemoryContextStore::new());
        Self {
            scheduler: PipelineScheduler::new(ctx, configs.clone(), contexts.clone()),
            configs,
            contexts,
            mock,
        }
    }

    fn activate(&self, user_id: &str, raw: Value) {
        tokio_test::assert_ok!(self.configs.create(user_id, "active", raw));
        assert!(self.configs.activate(user_id, "active"));
    }
}

#[tokio::test]
async fn final_text_is_the_last_stage_result() {
    let h = Harness::new(echo());
    h.activate("u1", json!({"a": [{"prompt": "X"}], "b": [{"prompt": "Y"}]}));

    let report = h.scheduler.run_detailed("question", "u1", None).await;

    assert_eq!(report.text, "R(Y)");
    assert_eq!(report.stage("a").unwrap().results[0].text, "R(X)");
    assert!(!report.text.contains("R(X)"));

    // stage b saw stage a's result
    let requests = h.mock.requests();
    assert_eq!(
        requests[1].last_user_content(),
        Some(
            "Исходный вопрос пользователя: question\n\nРезультаты предыдущих этапов:\n\na:\n  1. R(X)\n\nЗадача: Y"
        )
    );
}

#[tokio::test]
async fn no_active_config_uses_direct_call_and_keeps_carried_context() {
    let h = Harness::new(MockBackend::fixed("direct answer"));
    let carried = vec![SavedContextEntry {
        prompt: "P".into(),
        response: "R".into(),
    }];
    h.contexts.replace("u1", carried.clone()).await;

    let report = h.scheduler.run_detailed("hello", "u1", None).await;

    assert_eq!(report.text, "direct answer");
    assert_eq!(report.mode, GenerationMode::Direct);
    assert_eq!(h.mock.call_count(), 1);
    assert_eq!(h.mock.requests()[0].last_user_content(), Some("hello"));
    assert_eq!(h.contexts.peek("u1").await, carried);
}

#[tokio::test]
async fn saved_context_is_carried_exactly_once() {
    let h = Harness::new(echo());
    h.activate("u1", json!({"s": [{"prompt": "P", "saveLastAsContext": true}]}));

    // G: captures {P, R(P)}
    assert_eq!(h.scheduler.run("first", "u1", None).await, "R(P)");
    assert_eq!(
        h.contexts.peek("u1").await,
        vec![SavedContextEntry {
            prompt: "P".into(),
            response: "R(P)".into()
        }]
    );

    // G+1: sees it, and the new config saves nothing
    h.activate("u1", json!({"s": [{"prompt": "Q"}]}));
    h.scheduler.run("second", "u1", None).await;
    let seen = h.mock.requests()[1].last_user_content().unwrap().to_string();
    assert!(seen.contains("Контекст из предыдущей генерации:"));
    assert!(seen.contains("Промпт: P"));
    assert!(seen.contains("Ответ: R(P)"));
    assert!(h.contexts.peek("u1").await.is_empty());

    // G+2: nothing carried
    h.scheduler.run("third", "u1", None).await;
    let seen = h.mock.requests()[2].last_user_content().unwrap().to_string();
    assert!(!seen.contains("Промпт: P"));
    assert!(!seen.contains("Контекст из предыдущей генерации"));
}

#[tokio::test]
async fn saved_context_is_isolated_per_user() {
    let h = Harness::new(echo());
    h.activate("alice", json!({"s": [{"prompt": "secret", "saveLastAsContext": true}]}));
    h.activate("bob", json!({"s": [{"prompt": "hi"}]}));

    h.scheduler.run("q", "alice", None).await;
    h.scheduler.run("q", "bob", None).await;

    let bob_saw = h.mock.requests()[1].last_user_content().unwrap().to_string();
    assert!(!bob_saw.contains("secret"));
    assert_eq!(h.contexts.peek("alice").await.len(), 1);
}

#[tokio::test]
async fn blocked_result_is_hidden_from_later_stages_only() {
    let h = Harness::new(echo());
    h.activate(
        "u1",
        json!({
            "stage1": [
                {"prompt": "hidden", "blockOutsideInterstageContext": true},
                {"prompt": "shown"}
            ],
            "stage2": [{"prompt": "final"}]
        }),
    );

    let report = h.scheduler.run_detailed("q", "u1", None).await;

    let stage1: Vec<&str> = report
        .stage("stage1")
        .unwrap()
        .results
        .iter()
        .map(|r| r.text.as_str())
        .collect();
    assert_eq!(stage1, vec!["R(hidden)", "R(shown)"]);

    let stage2_request = h
        .mock
        .requests()
        .into_iter()
        .find(|r| r.last_user_content().unwrap_or_default().ends_with("Задача: final"))
        .unwrap();
    let content = stage2_request.last_user_content().unwrap();
    assert!(content.contains("  1. R(shown)"));
    assert!(!content.contains("R(hidden)"));
}

#[tokio::test]
async fn step_by_step_feeds_previous_result_forward() {
    let h = Harness::new(MockBackend::new(vec!["step one".into(), "step two".into()]));
    h.activate(
        "u1",
        json!({"s": [{"prompt": "A", "stepByStepRequest": true}, {"prompt": "B"}]}),
    );

    let text = h.scheduler.run("q", "u1", None).await;

    assert_eq!(text, "step one\n\nstep two");
    let second = h.mock.requests()[1].last_user_content().unwrap().to_string();
    assert!(second.contains("Результат предыдущего шага: step one"));
    assert!(second.ends_with("Задача: B"));
}

#[tokio::test]
async fn parallel_stage_costs_the_slowest_call() {
    let h = Harness::new(echo().with_delay(Duration::from_millis(250)));
    h.activate(
        "u1",
        json!({"s": [{"prompt": "1"}, {"prompt": "2"}, {"prompt": "3"}, {"prompt": "4"}]}),
    );

    let start = Instant::now();
    let text = h.scheduler.run("q", "u1", None).await;
    let elapsed = start.elapsed();

    assert_eq!(text, "R(1)\n\nR(2)\n\nR(3)\n\nR(4)");
    assert!(elapsed < Duration::from_millis(700), "took {:?}", elapsed);
}

#[tokio::test]
async fn stage_order_follows_the_document() {
    let h = Harness::new(echo());
    let raw: Value =
        serde_json::from_str(r#"{"zz": [{"prompt": "first"}], "aa": [{"prompt": "second"}]}"#)
            .unwrap();
    h.activate("u1", raw);

    let report = h.scheduler.run_detailed("q", "u1", None).await;
    let names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["zz", "aa"]);
    assert_eq!(report.text, "R(second)");
}

#[tokio::test]
async fn structured_prompt_receives_stage_context() {
    let h = Harness::new(MockBackend::fixed(r#"{"summary": "ok"}"#));
    h.activate(
        "u1",
        json!({
            "s": [{
                "messages": [
                    {"role": "system", "content": "Reply in JSON"},
                    {"role": "user", "content": "Data:\n{context}"}
                ],
                "json_schema": {"type": "object", "properties": {"summary": {"type": "string"}}},
                "temperature": 0.2
            }]
        }),
    );

    let text = h.scheduler.run("what?", "u1", None).await;

    assert_eq!(text, r#"{"summary": "ok"}"#);
    let request = &h.mock.requests()[0];
    assert_eq!(
        request.last_user_content(),
        Some("Data:\nИсходный вопрос пользователя: what?")
    );
    assert_eq!(request.config.temperature, 0.2);
}

#[test]
fn context_store_contract_without_a_runtime_macro() {
    let store = InMemoryContextStore::new();
    tokio_test::block_on(async {
        store
            .replace(
                "u1",
                vec![SavedContextEntry {
                    prompt: "P".into(),
                    response: "R".into(),
                }],
            )
            .await;
        assert_eq!(store.take_and_clear("u1").await.len(), 1);
        assert!(store.take_and_clear("u1").await.is_empty());
    });
}
