use dialoguer::Input;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default number of times an unclear answer is asked again.
pub const MAX_PROMPT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Yes,
    No,
    /// No usable answer within the allowed attempts.
    Abstain,
}

/// Something that can ask the user a question and hand back the raw answer.
/// `None` means no answer can be obtained (e.g. input closed).
pub trait DecisionProvider {
    fn ask(&self, prompt: &str) -> Option<String>;
}

/// Ask a yes/no question, re-asking on unclear input up to `attempts` times.
/// Anything short of a clear answer is [`Decision::Abstain`].
pub fn confirm(provider: &dyn DecisionProvider, prompt: &str, attempts: usize) -> Decision {
    for attempt in 1..=attempts {
        let Some(answer) = provider.ask(prompt) else {
            return Decision::Abstain;
        };
        match parse_answer(&answer) {
            Some(true) => return Decision::Yes,
            Some(false) => return Decision::No,
            None if attempt < attempts => println!("Please answer y or n. Try again."),
            None => {}
        }
    }
    Decision::Abstain
}

fn parse_answer(answer: &str) -> Option<bool> {
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Reads answers from the terminal.
pub struct TerminalPrompt;

impl DecisionProvider for TerminalPrompt {
    fn ask(&self, prompt: &str) -> Option<String> {
        Input::<String>::new()
            .with_prompt(format!("{} [y/n]", prompt))
            .allow_empty(true)
            .interact_text()
            .ok()
    }
}

/// Replays canned answers, then behaves like closed input.
#[derive(Default)]
pub struct ScriptedAnswers {
    answers: Mutex<VecDeque<String>>,
    asked: Mutex<usize>,
}

impl ScriptedAnswers {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            asked: Mutex::new(0),
        }
    }

    pub fn times_asked(&self) -> usize {
        *self.asked.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DecisionProvider for ScriptedAnswers {
    fn ask(&self, _prompt: &str) -> Option<String> {
        *self.asked.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        self.answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}
