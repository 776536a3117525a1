//! Deterministic synthetic campaign used by `simulate`.

use saga_common::{Map, Turn, Value};
use serde_json::json;

const LOCATIONS: [&str; 4] = ["harbor", "market", "watchtower", "old mill"];
const STATUSES: [&str; 3] = ["alive", "wounded", "resting"];

/// Output of one simulated turn.
pub struct SimTurn {
    pub state: Map,
    pub delta: Map,
}

/// Advance `previous` to `turn`.
///
/// The threat level climbs slowly with a short oscillation, two tracked
/// characters move between locations, and every fifth turn raises a flag.
pub fn advance(previous: &Map, turn: Turn) -> SimTurn {
    let mut state = previous.clone();
    let threat = (turn % 7) as f64 * 0.5 + turn as f64 * 0.1;
    let step = turn as usize;

    let npcs = json!({
        "ada": {
            "status": STATUSES[step % STATUSES.len()],
            "location": LOCATIONS[step % LOCATIONS.len()],
            "hp": 100 - (turn % 40) as i64,
        },
        "bram": {
            "status": "patrolling",
            "location": LOCATIONS[(step / 3) % LOCATIONS.len()],
        }
    });
    let description = if turn % 4 == 0 {
        format!(
            "Smugglers were sighted near the {} after nightfall on turn {turn}",
            LOCATIONS[step % LOCATIONS.len()]
        )
    } else {
        format!("Quiet watch on turn {turn}")
    };
    let flags: Vec<String> = if turn % 5 == 0 {
        vec![format!("milestone_{turn}")]
    } else {
        Vec::new()
    };

    state.insert("turn".into(), Value::from(turn as i64));
    state.insert("threat_level".into(), Value::from(threat));
    state.insert("npcs".into(), Value::from(npcs.clone()));
    push_entry(
        &mut state,
        "event_log",
        Value::from(json!({"turn": turn, "description": description})),
    );
    if let Some(Value::Map(flag_map)) = state.get_mut("flags") {
        for flag in &flags {
            flag_map.insert(flag.clone(), Value::Bool(true));
        }
    }

    let delta = match Value::from(json!({
        "turn": turn,
        "threat_level": threat,
        "npcs": npcs,
        "recent_events": [description],
        "flags_added": flags,
    })) {
        Value::Map(m) => m,
        _ => Map::new(),
    };
    SimTurn { state, delta }
}

fn push_entry(state: &mut Map, key: &str, entry: Value) {
    match state.get_mut(key) {
        Some(Value::List(items)) => items.push(entry),
        _ => {
            state.insert(key.to_string(), Value::List(vec![entry]));
        }
    }
}
