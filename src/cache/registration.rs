//! Persisted lifecycle record for the cache manager.

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
  /// First install in progress, nothing serving yet
  #[default]
  Installing,
  /// A generation is active and serving
  Active,
  /// A new generation is installing while the old one keeps serving
  Updating,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Active => "active",
      Self::Updating => "updating",
    }
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for LifecycleState {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "installing" => Ok(Self::Installing),
      "active" => Ok(Self::Active),
      "updating" => Ok(Self::Updating),
      other => Err(eyre!("Unknown lifecycle state: {}", other)),
    }
  }
}

/// Which generation serves, and which one is installed and waiting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Registration {
  pub state: LifecycleState,
  pub active: Option<String>,
  pub waiting: Option<String>,
}

impl Registration {
  /// Enter the install phase.
  pub fn begin_install(&mut self) {
    self.state = if self.active.is_some() {
      LifecycleState::Updating
    } else {
      LifecycleState::Installing
    };
    self.waiting = None;
  }

  /// Install finished; the generation is waiting and, since waiting is
  /// always skipped, immediately eligible for activation.
  pub fn install_succeeded(&mut self, generation: &str) {
    self.waiting = Some(generation.to_string());
  }

  pub fn can_activate(&self, generation: &str) -> bool {
    self.waiting.as_deref() == Some(generation)
      || (self.state == LifecycleState::Active && self.active.as_deref() == Some(generation))
  }

  /// Promote `generation` to active and claim clients.
  pub fn activate(&mut self, generation: &str) -> Result<()> {
    if !self.can_activate(generation) {
      return Err(eyre!(
        "Cache generation {} has not been installed",
        generation
      ));
    }
    self.active = Some(generation.to_string());
    self.waiting = None;
    self.state = LifecycleState::Active;
    Ok(())
  }

  /// Generation whose store answers intercepted requests.
  ///
  /// During an update the previous generation keeps serving.
  pub fn serving(&self) -> Option<&str> {
    self.active.as_deref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_first_install_then_activate() {
    let mut registration = Registration::default();
    registration.begin_install();
    assert_eq!(registration.state, LifecycleState::Installing);
    assert_eq!(registration.serving(), None);

    registration.install_succeeded("v1");
    registration.activate("v1").unwrap();
    assert_eq!(registration.state, LifecycleState::Active);
    assert_eq!(registration.serving(), Some("v1"));
    assert_eq!(registration.waiting, None);
  }

  #[test]
  fn test_update_keeps_old_generation_serving() {
    let mut registration = Registration {
      state: LifecycleState::Active,
      active: Some("v1".to_string()),
      waiting: None,
    };

    registration.begin_install();
    assert_eq!(registration.state, LifecycleState::Updating);
    registration.install_succeeded("v2");
    assert_eq!(registration.serving(), Some("v1"));

    registration.activate("v2").unwrap();
    assert_eq!(registration.serving(), Some("v2"));
  }

  #[test]
  fn test_activate_without_install_is_rejected() {
    let mut registration = Registration::default();
    assert!(registration.activate("v1").is_err());
    assert_eq!(registration.serving(), None);
  }

  #[test]
  fn test_reactivating_active_generation_is_allowed() {
    let mut registration = Registration {
      state: LifecycleState::Active,
      active: Some("v1".to_string()),
      waiting: None,
    };
    assert!(registration.activate("v1").is_ok());
  }

  #[test]
  fn test_state_round_trips_through_str() {
    for state in [
      LifecycleState::Installing,
      LifecycleState::Active,
      LifecycleState::Updating,
    ] {
      assert_eq!(state.as_str().parse::<LifecycleState>().unwrap(), state);
    }
    assert!("redundant".parse::<LifecycleState>().is_err());
  }
}
