//! Raw input passthrough over the CDP `Input` domain.
//!
//! Used when a human operator drives the page directly (manual intervention):
//! pointer and keyboard events arrive over the session channel and are
//! dispatched here without involving the control loop.

use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton,
};
use chromiumoxide::Page;
use serde::Deserialize;

/// Pointer action kinds accepted from the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseActionType {
    Click,
    Move,
    Down,
    Up,
    Scroll,
}

/// A pointer event in page coordinates.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MouseAction {
    pub action_type: MouseActionType,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub button: Option<String>,
    #[serde(default)]
    pub click_count: Option<i64>,
    #[serde(default)]
    pub delta_x: Option<f64>,
    #[serde(default)]
    pub delta_y: Option<f64>,
}

/// Keyboard action kinds accepted from the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyboardActionType {
    KeyDown,
    KeyUp,
    TextInput,
}

/// A keyboard event or literal text insertion.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyboardAction {
    pub action_type: KeyboardActionType,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    /// CDP modifier bitmask: 1=Alt, 2=Ctrl, 4=Meta, 8=Shift
    #[serde(default)]
    pub modifiers: Option<i64>,
}

fn resolve_button(button: Option<&str>) -> MouseButton {
    match button.map(|b| b.trim().to_lowercase()).as_deref() {
        Some("middle") => MouseButton::Middle,
        Some("right") => MouseButton::Right,
        _ => MouseButton::Left,
    }
}

async fn dispatch(
    page: &Page,
    event_type: DispatchMouseEventType,
    action: &MouseAction,
) -> anyhow::Result<()> {
    let mut builder = DispatchMouseEventParams::builder()
        .r#type(event_type)
        .x(action.x)
        .y(action.y)
        .button(resolve_button(action.button.as_deref()));
    if let Some(count) = action.click_count {
        builder = builder.click_count(count);
    }
    let params = builder
        .build()
        .map_err(|e| anyhow::anyhow!("Invalid mouse event: {}", e))?;
    page.execute(params).await?;
    Ok(())
}

/// Dispatch one pointer event to the page.
pub async fn dispatch_mouse(page: &Page, action: &MouseAction) -> anyhow::Result<()> {
    match action.action_type {
        MouseActionType::Click => {
            let mut press = action.clone();
            press.click_count = Some(action.click_count.unwrap_or(1));
            dispatch(page, DispatchMouseEventType::MousePressed, &press).await?;
            dispatch(page, DispatchMouseEventType::MouseReleased, &press).await
        }
        MouseActionType::Move => {
            dispatch(page, DispatchMouseEventType::MouseMoved, action).await
        }
        MouseActionType::Down => {
            dispatch(page, DispatchMouseEventType::MousePressed, action).await
        }
        MouseActionType::Up => {
            dispatch(page, DispatchMouseEventType::MouseReleased, action).await
        }
        MouseActionType::Scroll => {
            let params = DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseWheel)
                .x(action.x)
                .y(action.y)
                .delta_x(action.delta_x.unwrap_or(0.0))
                .delta_y(action.delta_y.unwrap_or(0.0))
                .build()
                .map_err(|e| anyhow::anyhow!("Invalid scroll event: {}", e))?;
            page.execute(params).await?;
            Ok(())
        }
    }
}

/// Dispatch one keyboard event or text insertion to the page.
pub async fn dispatch_keyboard(page: &Page, action: &KeyboardAction) -> anyhow::Result<()> {
    match action.action_type {
        KeyboardActionType::TextInput => {
            let text = action
                .text
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("text_input requires 'text'"))?;
            page.execute(InsertTextParams::new(text)).await?;
            Ok(())
        }
        KeyboardActionType::KeyDown | KeyboardActionType::KeyUp => {
            let key = action
                .key
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("key event requires 'key'"))?;
            let event_type = match action.action_type {
                KeyboardActionType::KeyDown => DispatchKeyEventType::KeyDown,
                _ => DispatchKeyEventType::KeyUp,
            };
            let mut builder = DispatchKeyEventParams::builder()
                .r#type(event_type)
                .key(key);
            if let Some(text) = action.text.as_deref() {
                builder = builder.text(text);
            }
            if let Some(modifiers) = action.modifiers {
                builder = builder.modifiers(modifiers);
            }
            let params = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Invalid key event: {}", e))?;
            page.execute(params).await?;
            Ok(())
        }
    }
}

/// Press and release Enter in the focused element.
pub async fn press_enter(page: &Page) -> anyhow::Result<()> {
    let down = DispatchKeyEventParams::builder()
        .r#type(DispatchKeyEventType::KeyDown)
        .text("\r")
        .unmodified_text("\r")
        .key("Enter")
        .code("Enter")
        .windows_virtual_key_code(13)
        .build()
        .map_err(|e| anyhow::anyhow!("Invalid key event: {}", e))?;
    page.execute(down).await?;

    let up = DispatchKeyEventParams::builder()
        .r#type(DispatchKeyEventType::KeyUp)
        .key("Enter")
        .code("Enter")
        .windows_virtual_key_code(13)
        .build()
        .map_err(|e| anyhow::anyhow!("Invalid key event: {}", e))?;
    page.execute(up).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_action_accepts_wire_format() {
        let action: MouseAction = serde_json::from_value(serde_json::json!({
            "actionType": "click",
            "x": 100.0,
            "y": 200.0,
            "button": "left",
            "clickCount": 2
        }))
        .unwrap();
        assert_eq!(action.action_type, MouseActionType::Click);
        assert_eq!(action.click_count, Some(2));
    }

    #[test]
    fn scroll_action_accepts_deltas() {
        let action: MouseAction = serde_json::from_value(serde_json::json!({
            "actionType": "scroll",
            "x": 10.0,
            "y": 20.0,
            "deltaY": -120.0
        }))
        .unwrap();
        assert_eq!(action.action_type, MouseActionType::Scroll);
        assert_eq!(action.delta_y, Some(-120.0));
    }

    #[test]
    fn keyboard_action_accepts_wire_format() {
        let action: KeyboardAction = serde_json::from_value(serde_json::json!({
            "actionType": "key_down",
            "key": "Enter",
            "modifiers": 2
        }))
        .unwrap();
        assert_eq!(action.action_type, KeyboardActionType::KeyDown);
        assert_eq!(action.key.as_deref(), Some("Enter"));
    }

    #[test]
    fn unknown_button_falls_back_to_left() {
        assert_eq!(resolve_button(Some("wheel-ish")), MouseButton::Left);
        assert_eq!(resolve_button(None), MouseButton::Left);
        assert_eq!(resolve_button(Some("Right")), MouseButton::Right);
    }
}
