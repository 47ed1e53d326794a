//! Command templates and bound commands.
//!
//! A [`CommandTemplate`] describes the static shape of one instrument command
//! and is normally declared once as a `const` next to the driver that uses it:
//!
//! ```rust
//! use daq_link::CommandTemplate;
//!
//! /// Firmware version query (Hamilton Protocol 1).
//! const FIRMWARE_VERSION: CommandTemplate = CommandTemplate::new("U").executed();
//! ```
//!
//! Binding a template to an address, value and argument yields a [`Command`].
//! Binding validates against the target [`FrameFormat`] and fails before any
//! byte is written when the address is out of range or a required argument is
//! missing.

use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::format::FrameFormat;

/// Immutable description of a command's static shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTemplate {
    /// Command mnemonic as sent on the wire (e.g. `"U"`, `"VER"`, `"FLOW?"`).
    pub mnemonic: &'static str,
    /// Separator written between the value and the argument, when an
    /// argument is present.
    pub optional_param_separator: &'static str,
    /// Binding fails with `MissingArgument` when this is set and the
    /// argument is empty.
    pub requires_argument: bool,
    /// Append the protocol's execute marker (Hamilton `R`).
    pub execute_flag: bool,
    /// Number of reply lines the device sends back. Zero means the device
    /// does not answer this command.
    pub expected_reply_lines: usize,
}

impl CommandTemplate {
    /// Template with no argument, no execute flag and a single reply line.
    pub const fn new(mnemonic: &'static str) -> Self {
        Self {
            mnemonic,
            optional_param_separator: "",
            requires_argument: false,
            execute_flag: false,
            expected_reply_lines: 1,
        }
    }

    /// Require an argument, written after `separator`.
    pub const fn with_argument(self, separator: &'static str) -> Self {
        Self {
            optional_param_separator: separator,
            requires_argument: true,
            ..self
        }
    }

    /// Allow an optional argument, written after `separator` when present.
    pub const fn with_optional_argument(self, separator: &'static str) -> Self {
        Self {
            optional_param_separator: separator,
            ..self
        }
    }

    /// Append the execute marker.
    pub const fn executed(self) -> Self {
        Self {
            execute_flag: true,
            ..self
        }
    }

    /// Set the number of reply lines.
    pub const fn with_reply_lines(self, lines: usize) -> Self {
        Self {
            expected_reply_lines: lines,
            ..self
        }
    }

    /// Command that the device never answers.
    pub const fn without_reply(self) -> Self {
        self.with_reply_lines(0)
    }

    /// Bind this template to a target address, value and argument.
    ///
    /// # Errors
    ///
    /// - `InvalidAddress` when `address` is outside `format.address_range()`
    /// - `MissingArgument` when the template requires an argument and
    ///   `argument` is empty
    /// - `InvalidArgument` when the format rejects the value or argument
    pub fn bind<F>(
        &self,
        format: &F,
        address: u16,
        value: impl Into<String>,
        argument: impl Into<String>,
    ) -> LinkResult<Command>
    where
        F: FrameFormat + ?Sized,
    {
        let range = format.address_range();
        if !range.contains(&address) {
            return Err(LinkError::invalid_address(address, &range));
        }

        let argument = argument.into();
        if self.requires_argument && argument.is_empty() {
            return Err(LinkError::new(
                ErrorKind::MissingArgument,
                format!("command '{}' requires an argument", self.mnemonic),
            ));
        }

        let command = Command {
            template: *self,
            address,
            value: value.into(),
            argument,
        };
        format.validate(&command)?;
        Ok(command)
    }
}

/// A template bound to a target address, value and argument.
///
/// Only constructed through [`CommandTemplate::bind`], so every `Command`
/// in existence has a valid address and its required argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    template: CommandTemplate,
    address: u16,
    value: String,
    argument: String,
}

impl Command {
    /// Template this command was bound from.
    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }

    /// Target address.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Mnemonic from the template.
    pub fn mnemonic(&self) -> &str {
        self.template.mnemonic
    }

    /// Value written directly after the mnemonic.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Argument written after the optional-parameter separator.
    pub fn argument(&self) -> &str {
        &self.argument
    }

    /// Separator-prefixed argument, or an empty string when there is no argument.
    pub fn separated_argument(&self) -> String {
        if self.argument.is_empty() {
            String::new()
        } else {
            format!(
                "{}{}",
                self.template.optional_param_separator, self.argument
            )
        }
    }

    /// Number of reply lines the device sends back.
    pub fn expected_reply_lines(&self) -> usize {
        self.template.expected_reply_lines
    }
}
