use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// DA (Date) value representation, formatted as `YYYYMMDD`.
pub type DA = String;

/// TM (Time) value representation, formatted as `HHMMSS`.
pub type TM = String;

/// Lifecycle of a worklist item as stored in `worklist_items.status`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ItemStatus {
	Scheduled,
	InProgress,
	Completed,
}

impl ItemStatus {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::Scheduled => "SCHEDULED",
			Self::InProgress => "IN_PROGRESS",
			Self::Completed => "COMPLETED",
		}
	}
}

impl Display for ItemStatus {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl TryFrom<&str> for ItemStatus {
	type Error = String;

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		match value {
			"SCHEDULED" => Ok(Self::Scheduled),
			"IN_PROGRESS" => Ok(Self::InProgress),
			"COMPLETED" => Ok(Self::Completed),
			other => Err(format!("Unknown worklist item status '{other}'")),
		}
	}
}

/// Status of a tracked performed procedure step (`mpps_tracking.status`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StepStatus {
	InProgress,
	Completed,
}

impl StepStatus {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::InProgress => "IN_PROGRESS",
			Self::Completed => "COMPLETED",
		}
	}
}

impl Display for StepStatus {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl TryFrom<&str> for StepStatus {
	type Error = String;

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		match value {
			"IN_PROGRESS" => Ok(Self::InProgress),
			"COMPLETED" => Ok(Self::Completed),
			other => Err(format!("Unknown procedure step status '{other}'")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn item_status_roundtrips_through_column_value() {
		for status in [
			ItemStatus::Scheduled,
			ItemStatus::InProgress,
			ItemStatus::Completed,
		] {
			assert_eq!(ItemStatus::try_from(status.as_str()), Ok(status));
		}
		assert!(ItemStatus::try_from("IN PROGRESS").is_err());
	}
}
