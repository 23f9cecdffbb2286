use std::io::Cursor;
use std::time::Duration;

use proptest::prelude::*;

use softphone_control::command::CommandIntent;
use softphone_control::line_channel::normalize;
use softphone_control::{
    CallPhase, CallStateMachine, DomainEvent, LineChannel, LineSignal, classify_text,
};

// --- Line channel ---

fn collect_lines(bytes: Vec<u8>) -> Vec<String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    runtime.block_on(async move {
        let mut channel = LineChannel::spawn(Cursor::new(bytes), Duration::from_millis(500));
        let mut lines = Vec::new();
        while let Some(signal) = channel.next().await {
            if let LineSignal::Line(line) = signal {
                lines.push(line.text);
            }
        }
        lines
    })
}

fn arb_output_line() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Bye".to_string()),
        Just("call trying 010326".to_string()),
        Just("registering phone sip:1001@pbx".to_string()),
        Just("   ".to_string()),
        Just(String::new()),
        "[a-z ]{0,12}",
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn channel_never_yields_empty_or_repeated_lines(
        lines in prop::collection::vec(arb_output_line(), 0..20),
        crlf in any::<bool>(),
    ) {
        let sep = if crlf { "\r\n" } else { "\n" };
        let bytes = lines.join(sep).into_bytes();
        let out = collect_lines(bytes);

        for line in &out {
            prop_assert!(!line.is_empty());
        }
        for pair in out.windows(2) {
            prop_assert_ne!(&pair[0], &pair[1]);
        }
    }

    #[test]
    fn channel_preserves_distinct_line_order(
        lines in prop::collection::vec("[a-z]{1,8}", 1..15),
    ) {
        let mut expected: Vec<String> = Vec::new();
        for line in &lines {
            if expected.last() != Some(line) {
                expected.push(line.clone());
            }
        }
        let bytes = format!("{}\n", lines.join("\n")).into_bytes();
        prop_assert_eq!(collect_lines(bytes), expected);
    }
}

// --- Normalisation and classification ---

proptest! {
    #[test]
    fn normalize_is_idempotent(text in any::<String>()) {
        let once = normalize(&text);
        prop_assert_eq!(normalize(&once), once);
    }

    #[test]
    fn classify_is_total_and_deterministic(text in any::<String>()) {
        let first = classify_text(&text);
        let second = classify_text(&text);
        prop_assert_eq!(first.name(), second.name());
    }

    #[test]
    fn classify_survives_case_folding_that_changes_length(
        parts in prop::collection::vec(
            prop::sample::select(vec![
                "call", "CALL", "registering phone ", "Ⱥ", "\u{212A}", "İ", "ß", " ", "1", "@",
            ]),
            0..12,
        ),
    ) {
        let text = parts.concat();
        let event = classify_text(&text);
        if let DomainEvent::Ringing { number } = &event {
            prop_assert!(text.contains(number.as_str()));
        }
        if let DomainEvent::Registering { endpoint: Some(endpoint) } = &event {
            prop_assert!(text.contains(endpoint.as_str()));
        }
    }

    #[test]
    fn hangup_words_always_end_the_call(
        prefix in "[a-z ]{0,10}",
        suffix in "[a-z0-9 ]{0,10}",
    ) {
        let text = format!("{prefix} bye {suffix}");
        prop_assert_eq!(classify_text(&text), DomainEvent::Ended);
    }
}

// --- State machine ---

fn arb_event() -> impl Strategy<Value = DomainEvent> {
    prop_oneof![
        Just(DomainEvent::Trying),
        "[0-9]{3,8}".prop_map(|number| DomainEvent::Ringing { number }),
        Just(DomainEvent::Answered),
        Just(DomainEvent::Ended),
        Just(DomainEvent::RegistrationFailed),
        Just(DomainEvent::StreamTimeout),
    ]
}

fn arb_command() -> impl Strategy<Value = CommandIntent> {
    prop_oneof![
        "[0-9]{3,8}".prop_map(|n| CommandIntent::call(&n)),
        Just(CommandIntent::answer()),
        Just(CommandIntent::bye()),
        Just(CommandIntent::hold()),
        Just(CommandIntent::un_hold()),
        Just(CommandIntent::mute()),
        Just(CommandIntent::un_mute()),
    ]
}

#[derive(Clone, Debug)]
enum Step {
    Command(CommandIntent),
    Event(DomainEvent),
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        arb_command().prop_map(Step::Command),
        arb_event().prop_map(Step::Event),
    ]
}

proptest! {
    #[test]
    fn idle_never_carries_call_details(steps in prop::collection::vec(arb_step(), 0..40)) {
        let mut machine = CallStateMachine::new();
        for step in &steps {
            match step {
                Step::Command(intent) => {
                    if machine.admit(intent).is_ok() {
                        machine.apply_command(intent);
                    }
                }
                Step::Event(event) => {
                    machine.apply_event(event);
                }
            }

            let call = machine.call();
            if call.phase == CallPhase::Idle {
                prop_assert!(call.peer_number.is_none());
                prop_assert!(!call.muted);
            }
        }
    }

    #[test]
    fn stream_end_always_resets(steps in prop::collection::vec(arb_step(), 0..20)) {
        let mut machine = CallStateMachine::new();
        for step in &steps {
            match step {
                Step::Command(intent) => {
                    machine.apply_command(intent);
                }
                Step::Event(event) => {
                    machine.apply_event(event);
                }
            }
        }
        machine.apply_event(&DomainEvent::StreamEnded);
        prop_assert_eq!(machine.call().phase, CallPhase::Idle);
        prop_assert!(!machine.registration().registered);
    }
}
