#![allow(dead_code)]

use anyhow::{Result, bail};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

use vault::backend::MemoryKeyBackend;
use vault::{
    AuthConfig, AuthCoordinator, AuthOutcome, BusyPolicy, CipherCodec, CredentialPrompt,
    CryptoScheme, KeyBackend, KeyPolicy, MemoryStore, PhraseCrypto, PromptCompletion,
    PromptDispatcher, PromptInfo, SecretKeyProvider, SeedStore, SeedVault,
};

pub const ALICE: &str = "bottom drive obey lake curtain smoke basket hold race lonely fit walk";
pub const BOB: &str = "legal winner thank year wave sausage worth useful legal winner thank yellow";

/// Master key material shared by [`seal`] and vaults built with
/// [`Options::sealed`].
pub const MATERIAL: [u8; 32] = [7; 32];

/// Encrypt `phrase` under [`MATERIAL`] outside any vault, so the vault under
/// test has not yet seen a credential check when it first reads the record.
pub fn seal(phrase: &str) -> String {
    let keys = SecretKeyProvider::new(
        Box::new(MemoryKeyBackend::with_material(&MATERIAL)),
        KeyPolicy::default(),
    );
    keys.record_authentication();
    CipherCodec::new(keys).encode(phrase).unwrap()
}

/// Store handle the test keeps after the vault takes ownership.
pub struct SharedStore(pub Arc<MemoryStore>);

impl SeedStore for SharedStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        self.0.get(name)
    }
    fn insert_new(&self, name: &str, record: &str) -> Result<bool> {
        self.0.insert_new(name, record)
    }
    fn remove(&self, name: &str) -> Result<bool> {
        self.0.remove(name)
    }
    fn names(&self) -> Result<BTreeSet<String>> {
        self.0.names()
    }
    fn clear(&self) -> Result<()> {
        self.0.clear()
    }
}

/// Stand-in for the native crypto library.
#[derive(Default)]
pub struct FakeCrypto {
    generated: AtomicUsize,
}

impl PhraseCrypto for FakeCrypto {
    fn generate_phrase(&self, _scheme: CryptoScheme, words: usize) -> Result<Zeroizing<String>> {
        if words == 0 {
            bail!("word count must be positive");
        }
        let n = self.generated.fetch_add(1, Ordering::SeqCst);
        let phrase = (0..words)
            .map(|i| format!("word{n}x{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Zeroizing::new(phrase))
    }

    fn validate_phrase(&self, phrase: &str, _scheme: CryptoScheme) -> bool {
        phrase.split(' ').count() >= 12
    }

    fn derive_address(&self, phrase: &str, scheme: CryptoScheme) -> Result<String> {
        let first = phrase.split(' ').next().unwrap_or_default();
        Ok(format!("{scheme}:{first}"))
    }

    fn sign(&self, phrase: &str, message: &[u8], _scheme: CryptoScheme) -> Result<Vec<u8>> {
        let mut signature = phrase.as_bytes()[..4].to_vec();
        signature.extend_from_slice(message);
        Ok(signature)
    }
}

/// Prompt answering from a script (success once the script runs dry),
/// optionally slowly, while tracking how many prompts overlap.
#[derive(Clone, Default)]
pub struct ScriptedPrompt {
    pub answers: Arc<Mutex<VecDeque<AuthOutcome>>>,
    pub presented: Arc<AtomicUsize>,
    pub open: Arc<AtomicUsize>,
    pub max_open: Arc<AtomicUsize>,
    pub delay: Duration,
    pub parked: Option<Arc<Mutex<Vec<PromptCompletion>>>>,
}

impl ScriptedPrompt {
    pub fn answer(&self, outcome: AuthOutcome) {
        self.answers.lock().unwrap().push_back(outcome);
    }

    pub fn presented(&self) -> usize {
        self.presented.load(Ordering::SeqCst)
    }
}

impl CredentialPrompt for ScriptedPrompt {
    fn present(&mut self, _info: &PromptInfo, completion: PromptCompletion) {
        self.presented.fetch_add(1, Ordering::SeqCst);
        if let Some(parked) = &self.parked {
            parked.lock().unwrap().push(completion);
            return;
        }

        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(open, Ordering::SeqCst);
        let outcome = self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(AuthOutcome::Succeeded);
        let delay = self.delay;
        let open = Arc::clone(&self.open);

        // Resolve off the dispatcher thread, the way platform callbacks do.
        thread::spawn(move || {
            thread::sleep(delay);
            open.fetch_sub(1, Ordering::SeqCst);
            match outcome {
                AuthOutcome::Succeeded => completion.succeed(),
                AuthOutcome::Failed => completion.fail(),
                AuthOutcome::Error { code, message } => completion.error(code, message),
            }
        });
    }
}

pub struct Harness {
    pub vault: Arc<SeedVault>,
    pub store: Arc<MemoryStore>,
    pub prompt: ScriptedPrompt,
    ui: Option<JoinHandle<()>>,
}

pub struct Options {
    pub auth_validity: Duration,
    pub timeout: Duration,
    pub busy_policy: BusyPolicy,
    pub backend: Option<Box<dyn KeyBackend>>,
    pub prompt: ScriptedPrompt,
    pub reject_duplicate_phrases: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            auth_validity: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            busy_policy: BusyPolicy::Wait,
            backend: None,
            prompt: ScriptedPrompt::default(),
            reject_duplicate_phrases: true,
        }
    }
}

impl Options {
    /// Vault keyed with [`MATERIAL`], reading records made by [`seal`].
    pub fn sealed() -> Self {
        Self {
            backend: Some(Box::new(MemoryKeyBackend::with_material(&MATERIAL))),
            ..Self::default()
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Options::default())
    }

    /// Sealed vault holding `records` before any credential check.
    pub fn holding(options: Options, records: &[(&str, &str)]) -> Self {
        let harness = Self::with(options);
        for (name, phrase) in records {
            harness.store.replace(name, &seal(phrase));
        }
        harness
    }

    pub fn with(options: Options) -> Self {
        let store = Arc::new(MemoryStore::new());
        let keys = SecretKeyProvider::new(
            options
                .backend
                .unwrap_or_else(|| Box::new(MemoryKeyBackend::new())),
            KeyPolicy {
                auth_validity: options.auth_validity,
                ..KeyPolicy::default()
            },
        );
        let (auth, dispatcher) = AuthCoordinator::new(
            AuthConfig {
                timeout: options.timeout,
                busy_policy: options.busy_policy,
                ..AuthConfig::default()
            },
            options.prompt.clone(),
        );
        let vault = SeedVault::new(
            Box::new(SharedStore(Arc::clone(&store))),
            CipherCodec::new(keys),
            auth,
            Box::new(FakeCrypto::default()),
        )
        .reject_duplicate_phrases(options.reject_duplicate_phrases);
        Self::serve(vault, dispatcher, store, options.prompt)
    }

    /// Run `dispatcher` on its own thread, standing in for the UI thread.
    pub fn serve(
        vault: SeedVault,
        dispatcher: PromptDispatcher,
        store: Arc<MemoryStore>,
        prompt: ScriptedPrompt,
    ) -> Self {
        let ui = thread::spawn(move || dispatcher.run());
        Self {
            vault: Arc::new(vault),
            store,
            prompt,
            ui: Some(ui),
        }
    }

    pub fn presented(&self) -> usize {
        self.prompt.presented()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.vault.shutdown();
        if let Some(ui) = self.ui.take() {
            ui.join().ok();
        }
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}
