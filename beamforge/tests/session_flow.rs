//! Multi-turn session scenarios: intake, clarification, checkpointing, edits.

use std::sync::Arc;

use beamforge::io::events::{EventStatus, ProgressEvent, channel};
use beamforge::session::{Session, SessionOutcome, SessionState};
use beamforge::stage::{StageError, StageTag};
use beamforge::actor::ActorError;
use beamforge::test_support::{
    FnModel, ScriptedModel, complete_call, files, first_prompt, machine, test_config, text_reply,
    tool_reply, write_call,
};
use beamforge::tree::FileMap;
use tokio::sync::mpsc::UnboundedReceiver;

fn drain(rx: &mut UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Clarify → answer → build → final summary → edit, with a checkpoint after each step.
///
/// Model script (single handler unit, beam of one, so the call order is fixed):
/// intake(clarify) | intake(ready), draft, handler, summary | edit, summary.
#[tokio::test]
async fn clarify_build_and_edit_round_trip() {
    let model = Arc::new(ScriptedModel::new(vec![
        text_reply("<clarify>Should todos have due dates?</clarify>"),
        text_reply("<ready>A todo list API without due dates.</ready>"),
        tool_reply(vec![
            write_call("s", "server/src/schema.ts", "export type Todo = { title: string };\n"),
            write_call("h", "server/src/handlers/list_todos.ts", "export {};\n"),
            complete_call("c"),
        ]),
        tool_reply(vec![
            write_call("t", "server/src/tests/list_todos.test.ts", "test('list', () => {});\n"),
            complete_call("c"),
        ]),
        text_reply("Add todo list API\n"),
        tool_reply(vec![
            write_call("e", "server/src/handlers/list_todos.ts", "export const sorted = true;\n"),
            complete_call("c"),
        ]),
        text_reply("Sort todo list"),
    ]));
    let temp = tempfile::tempdir().expect("tempdir");
    let checkpoint = temp.path().join("state/checkpoint.json");
    let (events, mut rx) = channel();
    let session = Session::new(machine(test_config(), model.clone()).with_events(events))
        .with_checkpoint(&checkpoint);
    let mut state = SessionState::new("todo app", FileMap::new());

    let outcome = session.run(&mut state).await.expect("intake");
    assert_eq!(
        outcome,
        SessionOutcome::NeedsInput {
            question: "Should todos have due dates?".to_string()
        }
    );
    assert_eq!(drain(&mut rx)[0].status, EventStatus::ClarificationNeeded);
    let saved = Session::load(&checkpoint).expect("checkpoint");
    assert_eq!(saved.refinements, 1);
    assert!(!saved.ready);

    let mut state = saved;
    let outcome = session.resume(&mut state, "no due dates").await.expect("build");
    let SessionOutcome::Complete { files, summary } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(summary, "Add todo list API");
    assert!(files.contains_key("server/src/tests/list_todos.test.ts"));
    assert_eq!(state.stage.request, "A todo list API without due dates.");
    assert_eq!(state.refinements, 0);

    let events = drain(&mut rx);
    let stages: Vec<_> = events.iter().filter_map(|e| e.stage.as_deref()).collect();
    assert!(stages.contains(&"build") && stages.contains(&"complete"));
    let last = events.last().expect("final event");
    assert_eq!(last.status, EventStatus::Final);
    assert_eq!(last.summary.as_deref(), Some("Add todo list API"));
    assert_eq!(last.diff_stat.len(), 3);
    assert!(last.diff.as_deref().is_some_and(|d| d.contains("+++ b/server/src/schema.ts")));
    assert!(
        model.requests()[1]
            .messages[0]
            .text()
            .contains("no due dates")
    );

    let mut state = Session::load(&checkpoint).expect("checkpoint");
    assert_eq!(state.stage.stage, StageTag::Complete);
    let outcome = session.resume(&mut state, "sort the list").await.expect("edit");
    let SessionOutcome::Complete { files, summary } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(summary, "Sort todo list");
    assert_eq!(
        files["server/src/handlers/list_todos.ts"],
        "export const sorted = true;\n"
    );
    assert_eq!(model.remaining(), 0);
}

#[tokio::test]
async fn too_many_clarifications_is_fatal() {
    let model = Arc::new(ScriptedModel::new(vec![
        text_reply("What is it for?"),
        text_reply("<clarify>Who uses it?</clarify>"),
    ]));
    let mut config = test_config();
    config.session.max_refinements = 1;
    let (events, mut rx) = channel();
    let session = Session::new(machine(config, model).with_events(events));
    let mut state = SessionState::new("app", FileMap::new());

    let first = session.run(&mut state).await.expect("first round");
    assert!(matches!(first, SessionOutcome::NeedsInput { .. }));

    let err = session
        .resume(&mut state, "for me")
        .await
        .expect_err("limit");
    assert_eq!(
        err.downcast_ref::<StageError>(),
        Some(&StageError::RefinementLimit { limit: 1 })
    );
    let events = drain(&mut rx);
    assert_eq!(events.last().map(|e| e.status), Some(EventStatus::Error));
}

/// A stage failure is checkpointed and reported; nothing is lost for a retry.
#[tokio::test]
async fn exhausted_stage_emits_error_and_keeps_checkpoint() {
    let model = Arc::new(ScriptedModel::new(vec![
        text_reply("<ready>app</ready>"),
        text_reply("hmm"),
        text_reply("still thinking"),
    ]));
    let mut config = test_config();
    config.search.max_depth = 1;
    let temp = tempfile::tempdir().expect("tempdir");
    let checkpoint = temp.path().join("checkpoint.json");
    let (events, mut rx) = channel();
    let session =
        Session::new(machine(config, model).with_events(events)).with_checkpoint(&checkpoint);
    let mut state = SessionState::new("app", FileMap::new());

    let err = session.run(&mut state).await.expect_err("exhausted");
    assert!(
        err.downcast_ref::<ActorError>().is_some(),
        "{err:#}"
    );
    assert_eq!(drain(&mut rx).last().map(|e| e.status), Some(EventStatus::Error));
    let saved = Session::load(&checkpoint).expect("checkpoint");
    assert!(saved.ready);
    assert_eq!(saved.stage.stage, StageTag::Draft);
    assert!(saved.stage.trajectory.is_some());
}

/// A hint given after a failed build is shown to the unit on retry, then dropped.
#[tokio::test]
async fn retry_hint_reaches_the_failed_build_unit() {
    const HINT: &str = "keep todos in an in-memory array";
    let model = Arc::new(FnModel::new(|request| {
        let prompt = first_prompt(request);
        if prompt.contains("Decide whether") {
            return Ok(text_reply("<ready>A todo list API.</ready>"));
        }
        if prompt.contains("one-line summary") {
            return Ok(text_reply("Add todo list API"));
        }
        if prompt.contains(HINT) {
            return Ok(tool_reply(vec![
                write_call(
                    "w",
                    "server/src/handlers/list_todos.ts",
                    "export const listTodos = () => [];\n",
                ),
                complete_call("c"),
            ]));
        }
        Ok(text_reply("not sure how to store todos"))
    }));
    let mut config = test_config();
    config.search.max_depth = 1;
    let session = Session::new(machine(config, model));
    let mut state = SessionState::new(
        "todo app",
        files(&[
            ("server/src/schema.ts", "export type Todo = { title: string };\n"),
            ("server/src/handlers/list_todos.ts", "export {};\n"),
        ]),
    );

    let err = session.run(&mut state).await.expect_err("build exhausted");
    assert!(err.downcast_ref::<ActorError>().is_some(), "{err:#}");
    assert_eq!(state.stage.stage, StageTag::Build);

    let outcome = session.resume(&mut state, HINT).await.expect("retry");
    assert!(matches!(outcome, SessionOutcome::Complete { .. }));
    assert_eq!(
        state.stage.files["server/src/handlers/list_todos.ts"],
        "export const listTodos = () => [];\n"
    );
    assert_eq!(state.stage.feedback, None);
}
