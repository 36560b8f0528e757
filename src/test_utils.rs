// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Helpers shared by the tests of several modules.

use std::sync::Arc;

use crate::config::DecoderConfig;
use crate::decoder::dummy::DummyBackend;
use crate::decoder::DecodeBuffer;
use crate::decoder::DecodeSession;
use crate::decoder::SubmitResult;
use crate::h264::testing::simple_stream;
use crate::h264::AccessUnitAssembler;
use crate::h264::ParameterSetState;
use crate::memfd::MemFdAllocator;
use crate::pool::BufferPool;
use crate::stats::PipelineStatistics;

/// Decode `count` frames with a software backend and return their buffers, in decode order.
pub fn decoded_buffers(count: usize) -> Vec<DecodeBuffer> {
    assert!(count > 0);
    let pool = Arc::new(BufferPool::new(Arc::new(MemFdAllocator), count + 8));
    let mut session = DecodeSession::new(
        DummyBackend::new(),
        pool,
        DecoderConfig {
            max_slice_size: 4096,
            ..Default::default()
        },
        Arc::new(PipelineStatistics::new()),
    );

    let mut state = ParameterSetState::new();
    let mut assembler = AccessUnitAssembler::new();
    let mut aus = Vec::new();
    for nal in simple_stream(1, count as u32 - 1) {
        aus.extend(assembler.push(nal.clone(), &state));
        state.process(&nal).unwrap();
    }
    aus.extend(assembler.flush());

    session
        .initialize(2, count + 2, state.sps().unwrap())
        .unwrap();

    let mut buffers = Vec::new();
    for au in aus {
        while let SubmitResult::Busy = session.submit_frame(&au.nals, &state).unwrap() {
            buffers.extend(session.reclaim().unwrap());
        }
    }
    while session.pending_frames() > 0 {
        buffers.extend(session.reclaim().unwrap());
    }

    assert_eq!(buffers.len(), count);
    buffers
}
