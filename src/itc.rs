// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

//! Inter-Thread-Communication

use std::{path::Path, thread};

use anyhow::{bail, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info};

use crate::{config::SimConfig, scheme::IndexScheme, SimulationResult};

/// Enum holding inter thread requests
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ITCRequest {
    /// Simulate the traces with the given index scheme.
    Simulate(IndexScheme),
    /// Stop worker.
    Terminate,
}

/// Enum holding inter thread responses
#[derive(Clone, Debug)]
pub enum ITCResponse {
    /// Answer to `Simulate`.
    Finished(Box<SimulationResult>),
    Failed(IndexScheme, String),
}

#[derive(Clone)]
pub struct BiChannel<Req, Resp> {
    sender: Sender<Req>,
    receiver: Receiver<Resp>,
}

impl<Req, Resp> BiChannel<Req, Resp> {
    pub fn send(&self, data: Req) -> Result<(), crossbeam_channel::SendError<Req>> {
        self.sender.send(data)
    }

    pub fn recv(&self) -> Result<Resp, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }
}

pub fn create_inter_thread_channels() -> (
    BiChannel<ITCRequest, ITCResponse>,
    BiChannel<ITCResponse, ITCRequest>,
) {
    let (s1, r1) = crossbeam_channel::unbounded();
    let (s2, r2) = crossbeam_channel::unbounded();

    (
        BiChannel {
            sender: s1,
            receiver: r2,
        },
        BiChannel {
            sender: s2,
            receiver: r1,
        },
    )
}

/// Blocking loop of a worker thread. Returns on `Terminate` or a closed channel.
fn process_requests<P: AsRef<Path>>(
    itc: BiChannel<ITCResponse, ITCRequest>,
    config: &SimConfig,
    traces: &[P],
    with_data: bool,
) {
    while let Ok(ITCRequest::Simulate(scheme)) = itc.recv() {
        debug!("Worker starts scheme {scheme}");
        let config = SimConfig {
            scheme,
            ..config.clone()
        };
        let response = match crate::simulate(&config, traces, with_data) {
            Ok(result) => ITCResponse::Finished(Box::new(result)),
            Err(e) => ITCResponse::Failed(scheme, format!("{e:?}")),
        };
        if itc.send(response).is_err() {
            break;
        }
    }
}

/// Simulate the traces once per scheme on up to `jobs` threads.
///
/// Results are returned in the order of `schemes`.
pub fn sweep<P: AsRef<Path> + Sync>(
    config: &SimConfig,
    traces: &[P],
    with_data: bool,
    schemes: &[IndexScheme],
    jobs: usize,
) -> Result<Vec<SimulationResult>> {
    let jobs = jobs.clamp(1, schemes.len().max(1));
    info!("Simulating {} scheme(s) on {} thread(s)", schemes.len(), jobs);
    let (main, worker) = create_inter_thread_channels();

    thread::scope(|scope| {
        for _ in 0..jobs {
            let itc = worker.clone();
            scope.spawn(move || process_requests(itc, config, traces, with_data));
        }
        for &scheme in schemes {
            main.send(ITCRequest::Simulate(scheme))?;
        }
        for _ in 0..jobs {
            main.send(ITCRequest::Terminate)?;
        }

        let mut results = Vec::with_capacity(schemes.len());
        for _ in schemes {
            match main.recv()? {
                ITCResponse::Finished(result) => results.push(*result),
                ITCResponse::Failed(scheme, reason) => {
                    bail!("Simulation with scheme {scheme} failed: {reason}")
                }
            }
        }
        results.sort_by_key(|result| {
            schemes
                .iter()
                .position(|&scheme| scheme == result.scheme)
                .unwrap_or(usize::MAX)
        });
        Ok(results)
    })
}
