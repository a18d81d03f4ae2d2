//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Petramap.
//
// Petramap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Petramap is distributed in the hope that  it will be useful, but WITHOUT
// ANY  WARRANTY; without  even the  implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Petramap. If not, see <http://www.gnu.org/licenses/>.

//! The per-connection command scheduler: the heart of the engine.
//!
//! An ordered list of commands is kept per connection. Each scheduling pass
//! gives every Executing command one `execute` step, emits the responses of
//! Finished commands strictly in command-reception order (errors jump the
//! queue so failures surface promptly), and then starts followers of the
//! leading command's concurrency group. Re-entrant calls (from callbacks
//! fired while a pass is running) only set a flag; the running pass loops
//! again, which guarantees forward progress without unbounded recursion.

use log::debug;

use super::command::{Command, CommandState, RespCond};
use super::processor::Processor;

#[derive(Default)]
pub struct Scheduler {
    pub commands: Vec<Command>,
    /// The command currently holding the connection's input, if any.
    pub reader: Option<u64>,
    running: bool,
    run_again: bool,
    next_id: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn add(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Whether the connection has no work, or only an IDLE in progress.
    pub fn idle(&self) -> bool {
        self.commands.iter().all(|c| match c.state {
            CommandState::Executing => "idle" == c.name,
            CommandState::Retired => true,
            _ => false,
        })
    }

    /// Runs scheduling passes until quiescent, then drops Retired commands.
    pub fn run(&mut self, proc: &mut Processor) {
        if self.running {
            self.run_again = true;
            return;
        }

        self.running = true;
        self.run_again = true;

        while self.run_again {
            self.run_again = false;
            debug!(
                "{} run_commands, {} commands",
                proc.log_prefix,
                self.commands.len(),
            );

            self.step_executing(proc);
            self.emit_in_order(proc);
            self.start_followers(proc);
        }

        self.running = false;
        self.commands
            .retain(|c| CommandState::Retired != c.state);
    }

    /// Gives every currently Executing command one step.
    fn step_executing(&mut self, proc: &mut Processor) {
        for command in &mut self.commands {
            if CommandState::Executing != command.state {
                continue;
            }

            if command.ok() {
                proc.execute(command);
            } else {
                command.finish();
            }
            self.reader = sync_reservation(self.reader, command);
        }
    }

    /// Emits responses for Finished commands, preserving reception order.
    ///
    /// A Finished command with an earlier sibling not yet emitted stays
    /// deferred, unless it failed: error responses surface immediately.
    fn emit_in_order(&mut self, proc: &mut Processor) {
        let mut earlier_pending = false;
        for command in &mut self.commands {
            if CommandState::Finished == command.state
                && Some(command.id) == self.reader
            {
                self.reader = None;
            }

            if CommandState::Finished == command.state
                && (!earlier_pending || !command.ok())
            {
                command.emit_responses(&mut proc.output);
            }
            if CommandState::Retired != command.state {
                earlier_pending = true;
            }
        }
    }

    /// Parses and starts commands that may run now.
    ///
    /// The leading command is the first one Executing or Finished; failing
    /// that, the first Unparsed or Blocked one. Starting from the leader,
    /// followers in the same positive concurrency group are started too.
    fn start_followers(&mut self, proc: &mut Processor) {
        let leader = self
            .commands
            .iter()
            .position(|c| {
                matches!(
                    c.state,
                    CommandState::Executing | CommandState::Finished,
                )
            })
            .or_else(|| {
                self.commands.iter().position(|c| {
                    matches!(
                        c.state,
                        CommandState::Unparsed | CommandState::Blocked,
                    )
                })
            });
        let Some(leader) = leader else {
            return;
        };

        let group = self.commands[leader].group();
        debug!(
            "{} leading command is {} (group {})",
            proc.log_prefix, self.commands[leader].tag, group,
        );

        for ix in leader..self.commands.len() {
            // Members already running, finished, or retired are skipped
            // past; only Unparsed/Blocked ones can be started.
            let startable = matches!(
                self.commands[ix].state,
                CommandState::Unparsed | CommandState::Blocked,
            );
            if !startable {
                continue;
            }

            if ix != leader
                && (0 == group || self.commands[ix].group() != group)
            {
                self.commands[ix].state = CommandState::Blocked;
                break;
            }

            let command = &mut self.commands[ix];
            if !command.valid_in(proc.state) {
                command.error(
                    RespCond::Bad,
                    "Not permitted in this state",
                );
                self.run_again = true;
                continue;
            }

            if CommandState::Unparsed == command.state {
                command.parse();
                if !command.ok() {
                    // Already Finished with BAD; emitted next pass.
                    self.run_again = true;
                    continue;
                }
            }

            command.state = CommandState::Executing;
            proc.execute(command);
            self.reader = sync_reservation(self.reader, command);
            self.run_again = true;
        }
    }

    /// Feeds a line of reserved input to the command holding the
    /// reservation. Returns whether a command consumed it.
    pub fn feed_reader(&mut self, proc: &mut Processor, line: &[u8]) -> bool {
        let Some(reader) = self.reader else {
            return false;
        };
        let Some(command) =
            self.commands.iter_mut().find(|c| reader == c.id)
        else {
            self.reader = None;
            return false;
        };

        proc.read(command, line);
        self.reader = sync_reservation(self.reader, command);
        true
    }
}

/// Applies a command's input-reservation request, and drops the reservation
/// once the holder is no longer Executing.
fn sync_reservation(reader: Option<u64>, command: &mut Command) -> Option<u64> {
    if CommandState::Executing == command.state {
        if std::mem::take(&mut command.wants_input) {
            return Some(command.id);
        }
    } else if Some(command.id) == reader {
        return None;
    }

    reader
}
