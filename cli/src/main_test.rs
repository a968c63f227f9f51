use super::*;
use medibot::answer::FallbackText;

fn step(index: u32, illustration: Illustration, failed: bool, fallback: Option<FallbackText>) -> StepResult {
    StepResult {
        index,
        title: format!("Step title {index}"),
        description: String::new(),
        illustration,
        illustration_failed: failed,
        fallback_text: fallback,
    }
}

#[test]
fn content_type_from_extension() {
    assert_eq!(content_type_for("labs.PDF"), "application/pdf");
    assert_eq!(content_type_for("rash.jpeg"), "image/jpeg");
    assert_eq!(content_type_for("scan.png"), "image/png");
    assert_eq!(content_type_for("notes"), "application/octet-stream");
}

#[test]
fn ready_answer_without_steps_is_just_text() {
    let answer = StructuredAnswer { answer: "Rest and drink water.".to_owned(), ..StructuredAnswer::default() };
    assert_eq!(render_answer(&answer), "Rest and drink water.\n");
}

#[test]
fn degraded_answer_shows_notice_and_fallback() {
    let fallback = FallbackText {
        action: "Compress".to_owned(),
        method: "Heel of hand".to_owned(),
        caution: String::new(),
        expected_result: "Blood flow".to_owned(),
    };
    let answer = StructuredAnswer {
        answer: "Perform CPR.".to_owned(),
        steps: vec![
            step(1, Illustration::Remote("https://cdn/1.png".to_owned()), false, None),
            step(2, Illustration::Absent, true, Some(fallback)),
        ],
        ..StructuredAnswer::default()
    };
    let text = render_answer(&answer);
    assert!(text.starts_with(&format!("! {DEGRADED_NOTICE}")));
    assert!(text.contains("(2 steps)"));
    assert!(text.contains("[image: https://cdn/1.png]"));
    assert!(text.contains("Visual temporarily unavailable"));
    assert!(text.contains("Action: Compress"));
    assert!(!text.contains("Caution:"));
}

#[test]
fn missing_image_renders_placeholder() {
    let rendered = render_step(&step(3, Illustration::Absent, false, None));
    assert!(rendered.contains("[Image not available]"));
}

#[test]
fn inline_image_is_summarized() {
    let rendered = render_step(&step(1, Illustration::Inline("aGVsbG8=".to_owned()), false, None));
    assert!(rendered.contains("inline png, 8 base64 chars"));
}

#[test]
fn cli_parses_ask_flags() {
    let cli = Cli::try_parse_from(["medibot", "ask", "How do I perform CPR?", "--no-images"]).unwrap();
    match cli.command {
        Command::Ask { question, no_images, attach } => {
            assert_eq!(question.as_deref(), Some("How do I perform CPR?"));
            assert!(no_images);
            assert!(attach.is_none());
        }
        other => panic!("unexpected command {other:?}"),
    }
}
