//! Injected DOM extraction scripts.
//!
//! Both scripts are self-contained IIFEs returning plain JSON so they
//! survive `returnByValue`. They tolerate missing panels by returning
//! `{ok: false}` instead of throwing; a throw would make the whole context
//! look broken to the sweep.

/// Cheap change probe. Runs every tick, so it touches as little of the DOM
/// as it can get away with.
pub(crate) const PROBE_SCRIPT: &str = r#"
(() => {
  const panel = document.querySelector('.agent-panel, .interactive-session');
  if (!panel) {
    return { ok: false };
  }
  const turns = panel.querySelectorAll('.chat-turn, .interactive-item-container');
  const status = panel.querySelector('.agent-status, .chat-status-bar');
  const last = turns.length ? turns[turns.length - 1] : null;
  return {
    ok: true,
    turnCount: turns.length,
    statusText: status ? status.textContent.trim() : null,
    isBusy: !!panel.querySelector('.codicon-loading, .chat-in-progress'),
    lastTurnLength: last ? last.textContent.length : 0,
  };
})()
"#;

/// Full conversation extraction. Only runs after the probe reports a
/// change.
pub(crate) const EXTRACTION_SCRIPT: &str = r#"
(() => {
  const panel = document.querySelector('.agent-panel, .interactive-session');
  if (!panel) {
    return { ok: false };
  }
  const turns = Array.from(
    panel.querySelectorAll('.chat-turn, .interactive-item-container')
  );
  const items = turns.map((turn) => {
    const isUser =
      turn.classList.contains('interactive-request') ||
      turn.classList.contains('user-turn');
    return {
      role: isUser ? 'user' : 'assistant',
      text: turn.textContent.trim(),
    };
  });
  const status = panel.querySelector('.agent-status, .chat-status-bar');
  const button = (label) =>
    Array.from(panel.querySelectorAll('a.action-label, button')).some(
      (el) => el.textContent.trim().toLowerCase() === label
    );
  return {
    ok: true,
    turnCount: items.length,
    items,
    statusText: status ? status.textContent.trim() : null,
    isBusy: !!panel.querySelector('.codicon-loading, .chat-in-progress'),
    hasAcceptAll: button('accept all'),
    hasRejectAll: button('reject all'),
  };
})()
"#;
