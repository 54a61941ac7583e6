//! minimal bevy + bevy_rag_chat example: a plain-text chat window.
//! - the plugin probes `/health` and `/starters` at startup.
//! - enter submits the prompt (the index is built first if needed).
//! - f5 builds/rebuilds the index, esc cancels a running answer, f2 clears.
//! - while the transcript is empty, alt+1-9 ask a conversation starter.
//!
//! env:
//!   RAG_CHAT_API_BASE   (default http://localhost:8000/nomad-oasis)

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_rag_chat::{
    ChatClient, ChatConfig, ChatErrorEvt, ChatFinishedEvt, ChatView, RagChatPlugin, RagChatSet,
    Readiness, Role,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct StatusText;
#[derive(Component)]
struct HistoryText;
#[derive(Component)]
struct PromptText;

#[derive(Resource, Default)]
struct PromptBuf(String);

const STARTER_KEYS: [KeyCode; 9] = [
    KeyCode::Digit1,
    KeyCode::Digit2,
    KeyCode::Digit3,
    KeyCode::Digit4,
    KeyCode::Digit5,
    KeyCode::Digit6,
    KeyCode::Digit7,
    KeyCode::Digit8,
    KeyCode::Digit9,
];

// ---------------------- main ----------------------

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let config = ChatConfig::from_env().unwrap_or_default();

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(config)
        .insert_resource(PromptBuf::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(RagChatPlugin)
        .add_systems(Startup, setup)
        .add_systems(Update, (handle_text_input, refresh_prompt_text))
        // view readers should run after bevy_rag_chat drains the session
        .add_systems(
            Update,
            (refresh_status_text, refresh_history_text, on_finished, on_error)
                .after(RagChatSet::Drain),
        )
        .run();
}

// ---------------------- setup ui ----------------------

fn setup(mut commands: Commands) {
    commands.spawn(Camera2d::default());

    let style_18 = TextFont { font_size: 18.0, ..default() };
    let style_14 = TextFont { font_size: 14.0, ..default() };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            p.spawn((
                Text::new(""),
                style_14.clone(),
                TextColor(Color::srgb_u8(170, 170, 170)),
                StatusText,
            ));
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_grow: 1.0,
                    flex_direction: FlexDirection::Column,
                    padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
            ))
            .with_children(|c| {
                c.spawn((Text::new(""), style_18.clone(), TextColor(Color::WHITE), HistoryText));
            });
            p.spawn((Text::new("> "), style_14.clone(), TextColor(Color::WHITE), PromptText));
        });
}

// ---------------------- input ----------------------

fn handle_text_input(
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    client: Option<Res<ChatClient>>,
    view: Res<ChatView>,
) {
    let Some(client) = client else { return };

    if keys.just_pressed(KeyCode::Escape) {
        info!(target: "chat_example", "cancel requested");
        client.cancel();
    }
    if keys.just_pressed(KeyCode::F5) && view.readiness != Readiness::Building && !view.streaming {
        client.build();
    }
    if keys.just_pressed(KeyCode::F2) {
        client.clear();
    }

    let alt = keys.any_pressed([KeyCode::AltLeft, KeyCode::AltRight]);
    if alt && view.messages.is_empty() {
        for (i, key) in STARTER_KEYS.iter().enumerate() {
            if keys.just_pressed(*key)
                && let Some(starter) = view.starters.get(i)
            {
                client.send(starter.clone());
                // swallow the digit typed by this key press
                ev_kbd.clear();
                return;
            }
        }
    }

    let before = prompt.0.len();
    for ev in ev_kbd.read() {
        if ev.state.is_pressed()
            && !alt
            && let Some(txt) = &ev.text
        {
            let s = txt.replace(['\r', '\n'], "");
            prompt.0.push_str(&s);
        }
    }

    let mut edited = prompt.0.len() != before;
    if keys.just_pressed(KeyCode::Backspace) {
        edited |= prompt.0.pop().is_some();
    }
    if edited {
        client.set_draft(prompt.0.clone());
    }

    if keys.just_pressed(KeyCode::Enter) && !prompt.0.trim().is_empty() && client.submit() {
        prompt.0.clear();
    }
}

// ---------------------- text refresh ----------------------

fn refresh_status_text(view: Res<ChatView>, mut q: Query<&mut Text, With<StatusText>>) {
    if !view.is_changed() {
        return;
    }
    let Ok(mut t) = q.single_mut() else { return };

    let mut out = String::new();
    if let Some(h) = &view.health {
        out.push_str(&format!(
            "health: {} | ollama: {}\n",
            h.status,
            h.ollama_label().unwrap_or_else(|| "?".into())
        ));
    }
    out.push_str(match view.readiness {
        Readiness::Unbuilt => "index not built: press f5 (or just ask)\n",
        Readiness::Building => "building index...\n",
        Readiness::Ready => "index ready (f5 to rebuild)\n",
    });
    if view.messages.is_empty() && !view.starters.is_empty() {
        for (i, s) in view.starters.iter().take(STARTER_KEYS.len()).enumerate() {
            out.push_str(&format!("[alt+{}] {}\n", i + 1, s));
        }
    }
    if let Some(err) = &view.last_error {
        out.push_str(&format!("error: {err}\n"));
    }
    t.0 = out;
}

fn refresh_history_text(view: Res<ChatView>, mut q: Query<&mut Text, With<HistoryText>>) {
    if !view.is_changed() {
        return;
    }
    let Ok(mut t) = q.single_mut() else { return };

    let mut out = String::new();
    for m in &view.messages {
        match m.role {
            Role::User => out.push_str(&format!("you: {}\n", m.content)),
            Role::Assistant => {
                out.push_str(&format!("assistant: {}\n", m.content));
                if !m.sources.is_empty() {
                    out.push_str(&format!("  sources: {}\n", m.sources.join(", ")));
                }
            }
        }
    }
    if view.streaming {
        out.push_str("generating...\n");
    }
    t.0 = out;
}

fn refresh_prompt_text(prompt: Res<PromptBuf>, mut q_prompt: Query<&mut Text, With<PromptText>>) {
    if prompt.is_changed()
        && let Ok(mut t) = q_prompt.single_mut()
    {
        t.0 = format!("> {} |", prompt.0);
    }
}

// ---------------------- chat events ----------------------

fn on_finished(mut ev: EventReader<ChatFinishedEvt>) {
    for ChatFinishedEvt { slot, end } in ev.read() {
        info!(target: "chat_example", "reply {} finished: {:?}", slot.index(), end);
    }
}

fn on_error(mut ev: EventReader<ChatErrorEvt>) {
    for ChatErrorEvt { slot, error } in ev.read() {
        error!(target: "chat_example", "chat error (slot={:?}): {}", slot, error);
    }
}
