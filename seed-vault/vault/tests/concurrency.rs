mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use vault::{AuthPhase, BusyPolicy, PromptCompletion, VaultError};

use common::{ALICE, BOB, Harness, Options, ScriptedPrompt, wait_until};

fn parked_prompt() -> (ScriptedPrompt, Arc<Mutex<Vec<PromptCompletion>>>) {
    let parked: Arc<Mutex<Vec<PromptCompletion>>> = Arc::default();
    let prompt = ScriptedPrompt {
        parked: Some(Arc::clone(&parked)),
        ..ScriptedPrompt::default()
    };
    (prompt, parked)
}

#[test]
fn concurrent_fetches_never_overlap_prompts() {
    let h = Harness::holding(
        Options {
            prompt: ScriptedPrompt {
                delay: Duration::from_millis(30),
                ..ScriptedPrompt::default()
            },
            ..Options::sealed()
        },
        &[("alice", ALICE), ("bob", BOB)],
    );

    let workers: Vec<_> = (0..6)
        .map(|i| {
            let vault = Arc::clone(&h.vault);
            thread::spawn(move || {
                let name = if i % 2 == 0 { "alice" } else { "bob" };
                vault.fetch(name).map(|phrase| phrase.as_str().to_owned())
            })
        })
        .collect();

    for (i, worker) in workers.into_iter().enumerate() {
        let expected = if i % 2 == 0 { ALICE } else { BOB };
        assert_eq!(worker.join().unwrap().unwrap(), expected);
    }
    assert_eq!(h.prompt.max_open.load(Ordering::SeqCst), 1);
    assert_eq!(h.presented(), 1);
}

#[test]
fn fail_fast_rejects_second_request_while_prompting() {
    let (prompt, parked) = parked_prompt();
    let h = Harness::holding(
        Options {
            busy_policy: BusyPolicy::FailFast,
            prompt,
            ..Options::sealed()
        },
        &[("alice", ALICE)],
    );

    let vault = Arc::clone(&h.vault);
    let first = thread::spawn(move || vault.fetch("alice").map(|p| p.as_str().to_owned()));
    wait_until("first prompt", || parked.lock().unwrap().len() == 1);
    assert_eq!(h.vault.auth_phase(), AuthPhase::Prompting);

    assert!(matches!(
        h.vault.fetch("alice").unwrap_err(),
        VaultError::AuthenticationBusy
    ));

    let completion = parked.lock().unwrap().pop().unwrap();
    completion.succeed();
    assert_eq!(first.join().unwrap().unwrap(), ALICE);
    assert_eq!(h.presented(), 1);
}

#[test]
fn waiting_request_runs_after_current_session() {
    let (prompt, parked) = parked_prompt();
    let h = Harness::holding(
        Options {
            auth_validity: Duration::ZERO,
            prompt,
            ..Options::sealed()
        },
        &[("alice", ALICE)],
    );

    let spawn_fetch = || {
        let vault = Arc::clone(&h.vault);
        thread::spawn(move || vault.fetch("alice").map(|p| p.as_str().to_owned()))
    };

    let first = spawn_fetch();
    wait_until("first prompt", || parked.lock().unwrap().len() == 1);
    let second = spawn_fetch();

    // The second request queues behind the first instead of prompting.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(h.presented(), 1);

    parked.lock().unwrap().pop().unwrap().fail();
    assert!(matches!(
        first.join().unwrap().unwrap_err(),
        VaultError::AuthenticationDenied(_)
    ));

    wait_until("second prompt", || parked.lock().unwrap().len() == 1);
    parked.lock().unwrap().pop().unwrap().fail();
    assert!(matches!(
        second.join().unwrap().unwrap_err(),
        VaultError::AuthenticationDenied(_)
    ));
    assert_eq!(h.presented(), 2);
}

#[test]
fn queued_fetch_reuses_the_first_success() {
    let (prompt, parked) = parked_prompt();
    let h = Harness::holding(
        Options {
            prompt,
            ..Options::sealed()
        },
        &[("alice", ALICE), ("bob", BOB)],
    );

    let vault = Arc::clone(&h.vault);
    let first = thread::spawn(move || vault.fetch("alice").map(|p| p.as_str().to_owned()));
    wait_until("first prompt", || parked.lock().unwrap().len() == 1);

    let vault = Arc::clone(&h.vault);
    let second = thread::spawn(move || vault.fetch("bob").map(|p| p.as_str().to_owned()));
    thread::sleep(Duration::from_millis(50));

    parked.lock().unwrap().pop().unwrap().succeed();
    assert_eq!(first.join().unwrap().unwrap(), ALICE);
    assert_eq!(second.join().unwrap().unwrap(), BOB);
    assert_eq!(h.presented(), 1);
    assert!(parked.lock().unwrap().is_empty());
}

#[test]
fn shutdown_cancels_pending_fetch() {
    let (prompt, parked) = parked_prompt();
    let h = Harness::holding(
        Options {
            prompt,
            ..Options::sealed()
        },
        &[("alice", ALICE)],
    );

    let vault = Arc::clone(&h.vault);
    let pending = thread::spawn(move || vault.fetch("alice").map(|_| ()));
    wait_until("prompt", || parked.lock().unwrap().len() == 1);

    h.vault.shutdown();
    assert!(matches!(
        pending.join().unwrap().unwrap_err(),
        VaultError::AuthenticationCancelled
    ));

    // A completion arriving after cancellation changes nothing.
    parked.lock().unwrap().pop().unwrap().succeed();
    assert!(matches!(
        h.vault.fetch("alice").unwrap_err(),
        VaultError::AuthenticationCancelled
    ));
}
