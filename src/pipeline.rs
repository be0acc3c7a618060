//! Frozen replay plans over a compiled graph.
//!
//! A [`Pipeline`] captures the transitive dependencies of a terminal node in
//! topological order once, then replays forward and backward passes against
//! that order on every call. Work is encoded on the calling thread and
//! batched into command buffers of at most
//! [`DeviceConfig::commands_per_buffer`](crate::device::DeviceConfig::commands_per_buffer)
//! node dispatches; every buffer but the last is committed with
//! [`commit_and_continue`](CommandBuffer::commit_and_continue) so the queue
//! starts executing while encoding goes on. Each public call ends in exactly
//! one blocking wait.
//!
//! # Gradient resets
//!
//! Before a backward pass the gradient of every storage owner in the graph is
//! zeroed once. Views are skipped (their owner is reset through its own
//! node), and so is the terminal's owner, which holds the seed gradient.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashSet;

use crate::buffer::Buffer;
use crate::command::{CommandBuffer, CommandQueue};
use crate::error::{Error, Result};
use crate::node::Tensor;
use crate::optim::ParameterUpdate;

/// Orders `terminal` and everything it depends on so that every node comes
/// after its dependencies. Each node appears once.
pub(crate) fn topological_order(terminal: &Tensor) -> Vec<Tensor> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(terminal.clone(), false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        stack.push((node.clone(), true));
        for dep in node.deps().iter().rev() {
            if !visited.contains(&dep.id()) {
                stack.push((dep.clone(), false));
            }
        }
    }
    order
}

/// Releases the busy flag when a run ends, even on early return.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Topologically sorted replay plan for one terminal node.
pub struct Pipeline {
    queue: CommandQueue,
    terminal: Tensor,
    nodes: Vec<Tensor>,
    resets: Vec<Buffer>,
    commands_per_buffer: usize,
    running: AtomicBool,
}

impl Pipeline {
    pub(crate) fn new(queue: CommandQueue, terminal: &Tensor, commands_per_buffer: usize) -> Self {
        let nodes = topological_order(terminal);
        let mut owners = HashSet::new();
        owners.insert(terminal.owner());
        let resets: Vec<Buffer> = nodes
            .iter()
            .filter(|n| !n.is_view() && owners.insert(n.owner()))
            .map(|n| n.grad().clone())
            .collect();
        log::debug!(
            "{}: compiled pipeline over {} nodes ({} gradient owners, {} parameters)",
            queue.label(),
            nodes.len(),
            resets.len(),
            nodes.iter().filter(|n| n.is_parameter()).count()
        );
        Self {
            queue,
            terminal: terminal.clone(),
            nodes,
            resets,
            commands_per_buffer: commands_per_buffer.max(1),
            running: AtomicBool::new(false),
        }
    }

    /// Nodes in dependency order; the terminal is last.
    pub fn nodes(&self) -> &[Tensor] {
        &self.nodes
    }

    /// The node this pipeline was compiled for.
    pub fn terminal(&self) -> &Tensor {
        &self.terminal
    }

    /// Parameter leaves reachable from the terminal, in dependency order.
    pub fn parameters(&self) -> Vec<Tensor> {
        self.nodes
            .iter()
            .filter(|n| n.is_parameter())
            .cloned()
            .collect()
    }

    /// Runs every forward kernel and blocks until they have executed.
    ///
    /// # Errors
    /// Returns [`Error::PipelineBusy`] on re-entrant use, or the first
    /// failure of any command.
    pub fn forward(&self) -> Result<()> {
        let _run = self.enter()?;
        let mut cmd = self.queue.command_buffer();
        self.encode_forward(&mut cmd)?;
        cmd.commit_and_wait()
    }

    /// Runs the forward pass and returns a copy of the terminal's values.
    ///
    /// # Errors
    /// See [`Pipeline::forward`].
    pub fn evaluate(&self) -> Result<Vec<f32>> {
        self.forward()?;
        Ok(self.terminal.values())
    }

    /// Zeroes gradients and runs every backward kernel in reverse order.
    ///
    /// The terminal's gradient is left as the caller set it: it is the seed
    /// of the pass.
    ///
    /// # Errors
    /// See [`Pipeline::forward`].
    pub fn backward(&self) -> Result<()> {
        let _run = self.enter()?;
        let mut cmd = self.queue.command_buffer();
        self.encode_reset(&mut cmd);
        self.encode_backward(&mut cmd)?;
        cmd.commit_and_wait()
    }

    /// One training step: forward, gradient reset, a ones seed at the
    /// terminal, backward, then `update`, all in one chain with a single wait.
    ///
    /// # Errors
    /// See [`Pipeline::forward`].
    pub fn train_iteration<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut CommandBuffer),
    {
        let _run = self.enter()?;
        let mut cmd = self.queue.command_buffer();
        self.encode_forward(&mut cmd)?;
        self.encode_reset(&mut cmd);
        let seed = self.terminal.grad().clone();
        cmd.encode(move || {
            seed.fill(1.0);
            Ok(())
        });
        self.encode_backward(&mut cmd)?;
        update(&mut cmd);
        cmd.commit_and_wait()
    }

    /// [`train_iteration`](Self::train_iteration) driven by a bound optimizer.
    ///
    /// # Errors
    /// See [`Pipeline::forward`].
    pub fn train_step<U>(&self, update: &mut U, iteration: usize) -> Result<()>
    where
        U: ParameterUpdate + ?Sized,
    {
        log::trace!("{}: iteration {iteration}", self.queue.label());
        self.train_iteration(|cmd| update.update(cmd, iteration))
    }

    fn enter(&self) -> Result<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| Error::PipelineBusy)?;
        Ok(RunGuard(&self.running))
    }

    fn flush(&self, cmd: &mut CommandBuffer) -> Result<()> {
        if cmd.len() >= self.commands_per_buffer {
            cmd.commit_and_continue()?;
        }
        Ok(())
    }

    fn encode_forward(&self, cmd: &mut CommandBuffer) -> Result<()> {
        for node in &self.nodes {
            node.forward(cmd);
            self.flush(cmd)?;
        }
        Ok(())
    }

    fn encode_reset(&self, cmd: &mut CommandBuffer) {
        if self.resets.is_empty() {
            return;
        }
        let resets = self.resets.clone();
        cmd.encode(move || {
            for grad in &resets {
                grad.fill(0.0);
            }
            Ok(())
        });
    }

    fn encode_backward(&self, cmd: &mut CommandBuffer) -> Result<()> {
        for node in self.nodes.iter().rev() {
            node.backward(cmd);
            self.flush(cmd)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("terminal", &self.terminal.id())
            .field("nodes", &self.nodes.len())
            .field("resets", &self.resets.len())
            .field("commands_per_buffer", &self.commands_per_buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceConfig};
    use crate::shape::Shape;

    #[test]
    fn diamond_is_ordered_once() {
        let device = Device::cpu().unwrap();
        let x = device.new_data_with_values(Shape::vector(2), &[1.0, 2.0]).unwrap();
        let a = device.relu(&x).unwrap();
        let b = device.sigmoid(&x).unwrap();
        let y = device.add_equal(&a, &b).unwrap();
        let order = topological_order(&y);
        assert_eq!(order.len(), 4);
        let pos = |t: &Tensor| order.iter().position(|n| n.ptr_eq(t)).unwrap();
        assert_eq!(pos(&x), 0);
        assert!(pos(&a) < pos(&y) && pos(&b) < pos(&y));
        assert_eq!(pos(&y), 3);
    }

    #[test]
    fn small_buffers_split_the_chain() {
        let config = DeviceConfig::default().with_commands_per_buffer(1);
        let device = Device::new(config).unwrap();
        let x = device.new_data_with_values(Shape::vector(3), &[-1.0, 0.5, 2.0]).unwrap();
        let mut y = x.clone();
        for _ in 0..5 {
            y = device.relu(&y).unwrap();
        }
        let pipeline = device.compile(&y);
        assert_eq!(pipeline.evaluate().unwrap(), vec![0.0, 0.5, 2.0]);
    }

    #[test]
    fn busy_guard_releases() {
        let device = Device::cpu().unwrap();
        let x = device.new_data(Shape::vector(1)).unwrap();
        let pipeline = device.compile(&device.relu(&x).unwrap());
        let guard = pipeline.enter().unwrap();
        assert!(matches!(pipeline.forward(), Err(Error::PipelineBusy)));
        drop(guard);
        pipeline.forward().unwrap();
    }
}
