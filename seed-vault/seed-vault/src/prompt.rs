use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use sha2::{Digest, Sha256};
use std::io::{self, BufRead, BufReader, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use vault::auth::ERROR_CANCELED;
use vault::{CredentialPrompt, PromptCompletion, PromptInfo};
use zeroize::Zeroizing;

const ERROR_INPUT: i32 = 1;

/// Device credential check on the controlling terminal.
///
/// Reads a PIN from stdin with echo off and compares its SHA-256 with the
/// configured digest. Without a configured digest the device counts as
/// having no credential enrolled.
///
/// The PIN is read on a helper thread so the dispatcher keeps serving; an
/// abandoned prompt's reader answers the next prompt instead.
pub struct TerminalPrompt {
    shared: Arc<PinReader>,
    control_echo: bool,
}

struct PinReader {
    pin_sha256: Option<String>,
    input: Mutex<Box<dyn BufRead + Send>>,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    pending: Option<PromptCompletion>,
    reading: bool,
    saved_echo: Option<Termios>,
}

impl TerminalPrompt {
    pub fn new(pin_sha256: Option<String>) -> Self {
        Self::with_input(pin_sha256, Box::new(BufReader::new(io::stdin())), true)
    }

    fn with_input(
        pin_sha256: Option<String>,
        input: Box<dyn BufRead + Send>,
        control_echo: bool,
    ) -> Self {
        Self {
            shared: Arc::new(PinReader {
                pin_sha256: pin_sha256.map(|d| d.to_ascii_lowercase()),
                input: Mutex::new(input),
                slot: Mutex::default(),
            }),
            control_echo,
        }
    }
}

pub fn hex_digest(input: &[u8]) -> String {
    Sha256::digest(input)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turn echo off on stdin, returning the settings to restore. `None` when
/// stdin is not a terminal.
fn silence_echo() -> Option<Termios> {
    let saved = termios::tcgetattr(io::stdin()).ok()?;
    let mut quiet = saved.clone();
    quiet.local_flags.remove(LocalFlags::ECHO);
    quiet.local_flags.insert(LocalFlags::ECHONL);
    if let Err(e) = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &quiet) {
        log::warn!("failed to disable terminal echo: {e}");
        return None;
    }
    Some(saved)
}

fn restore_echo(saved: &Termios) {
    if let Err(e) = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, saved) {
        log::warn!("failed to restore terminal echo: {e}");
    }
}

impl PinReader {
    fn matches(&self, pin: &str) -> bool {
        self.pin_sha256.as_deref().is_some_and(|expected| {
            constant_time_eq(hex_digest(pin.as_bytes()).as_bytes(), expected.as_bytes())
        })
    }

    /// Read one line and resolve whichever prompt is pending by then.
    fn read_one(&self) {
        let mut line = Zeroizing::new(String::new());
        let read = lock(&self.input).read_line(&mut line);

        let mut slot = lock(&self.slot);
        slot.reading = false;
        if let Some(saved) = slot.saved_echo.take() {
            restore_echo(&saved);
        }
        let Some(completion) = slot.pending.take() else {
            log::debug!("discarding PIN entered after its prompt closed");
            return;
        };
        drop(slot);

        match read {
            Ok(0) => completion.error(ERROR_CANCELED, "no PIN entered"),
            Ok(_) if self.matches(line.trim_end_matches(['\r', '\n'])) => completion.succeed(),
            Ok(_) => {
                log::warn!("PIN mismatch");
                completion.fail();
            }
            Err(e) => completion.error(ERROR_INPUT, format!("failed to read PIN: {e}")),
        }
    }
}

impl CredentialPrompt for TerminalPrompt {
    fn can_authenticate(&self) -> bool {
        self.shared.pin_sha256.is_some()
    }

    fn present(&mut self, info: &PromptInfo, completion: PromptCompletion) {
        if self.shared.pin_sha256.is_none() {
            completion.error(ERROR_CANCELED, "no PIN configured");
            return;
        }

        eprintln!("{}", info.title);
        if !info.subtitle.is_empty() {
            eprintln!("{}", info.subtitle);
        }

        let mut slot = lock(&self.shared.slot);
        if self.control_echo && slot.saved_echo.is_none() {
            slot.saved_echo = silence_echo();
        }
        eprint!("PIN: ");
        io::stderr().flush().ok();

        // A replaced completion belongs to a session that already timed out.
        slot.pending = Some(completion);
        if slot.reading {
            return;
        }

        let reader = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("pin-reader".into())
            .spawn(move || reader.read_one());
        match spawned {
            Ok(_) => slot.reading = true,
            Err(e) => {
                if let Some(saved) = slot.saved_echo.take() {
                    restore_echo(&saved);
                }
                if let Some(completion) = slot.pending.take() {
                    completion.error(ERROR_INPUT, format!("failed to start PIN reader: {e}"));
                }
            }
        }
    }
}

impl Drop for TerminalPrompt {
    fn drop(&mut self) {
        let mut slot = lock(&self.shared.slot);
        slot.pending.take();
        if let Some(saved) = slot.saved_echo.take() {
            restore_echo(&saved);
        }
    }
}
