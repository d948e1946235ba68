use crate::config::Config;
use crate::patcher::{process_file, Outcome};
use dioxus::desktop::{Config as DesktopConfig, LogicalSize, WindowBuilder};
use dioxus::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};

pub const WINDOW_TITLE: &str = "FixDynamicBase - Drag PE Here";
const DIALOG_TITLE: &str = "FixDynamicBase";

const STYLE: &str = r#"
body { margin: 0; font-family: sans-serif; user-select: none; }
.drop-zone {
	position: fixed; inset: 8px;
	display: flex; align-items: center; justify-content: center;
	border: 2px dashed #888; border-radius: 6px; color: #444;
}
.drop-zone.hover { border-color: #2a7ae2; background: #eef4fd; }
.backdrop {
	position: fixed; inset: 0; background: rgba(0, 0, 0, 0.35);
	display: flex; align-items: center; justify-content: center;
}
.dialog { background: #fff; padding: 10px 14px; border-radius: 4px; max-width: 90%; }
.dialog h4 { margin: 0 0 6px 0; }
.dialog pre { white-space: pre-wrap; word-break: break-all; margin: 0 0 8px 0; font-family: inherit; }
.dialog.failure h4 { color: #b00020; }
"#;

/// Idle until a file is dropped. The drop handler runs the whole patch
/// synchronously, so the window never observes a processing state; the
/// result stays on screen until dismissed.
#[derive(Debug, Clone, PartialEq)]
enum ShellState {
	Idle,
	Reported(Outcome),
}

/// Runs one drop to completion. Only the first path is used, and nothing
/// happens while a report is still open. `None` leaves the state unchanged.
fn handle_drop(state: &ShellState, paths: Vec<String>, config: &Config) -> Option<ShellState> {
	if *state != ShellState::Idle {
		debug!("ignoring drop while a report is open");
		return None;
	}
	let path = paths.into_iter().next().map(PathBuf::from)?;
	Some(ShellState::Reported(process_file(&path, config)))
}

pub fn launch(config: Config) {
	let window = WindowBuilder::new()
		.with_title(WINDOW_TITLE)
		.with_inner_size(LogicalSize::new(520.0, 160.0))
		.with_resizable(false);

	info!("opening window");
	LaunchBuilder::desktop()
		.with_cfg(DesktopConfig::new().with_window(window))
		.with_context(config)
		.launch(App);
}

#[component]
fn App() -> Element {
	let config = use_context::<Config>();
	let mut state = use_signal(|| ShellState::Idle);
	let mut hovering = use_signal(|| false);

	let on_drop = move |evt: DragEvent| {
		hovering.set(false);
		let paths = evt.files().map(|engine| engine.files()).unwrap_or_default();
		let next = handle_drop(&state.read(), paths, &config);
		if let Some(next) = next {
			state.set(next);
		}
	};

	let zone_class = if hovering() { "drop-zone hover" } else { "drop-zone" };
	let dialog = match state() {
		ShellState::Idle => None,
		ShellState::Reported(outcome) => Some(outcome),
	};

	rsx! {
		style { {STYLE} }
		div {
			class: "{zone_class}",
			prevent_default: "ondragover ondrop",
			ondragover: move |_| hovering.set(true),
			ondragleave: move |_| hovering.set(false),
			ondrop: on_drop,
			"Drop an executable here to clear DYNAMIC_BASE"
		}
		{dialog.map(move |outcome| rsx! {
			Dialog {
				outcome: outcome,
				on_close: move |_| state.set(ShellState::Idle),
			}
		})}
	}
}

#[component]
fn Dialog(outcome: Outcome, on_close: EventHandler<MouseEvent>) -> Element {
	let class = if outcome.is_failure() { "dialog failure" } else { "dialog" };
	let message = outcome.to_string();

	rsx! {
		div { class: "backdrop",
			div { class: "{class}",
				h4 { "{DIALOG_TITLE}" }
				pre { "{message}" }
				button { autofocus: true, onclick: move |evt| on_close.call(evt), "OK" }
			}
		}
	}
}
