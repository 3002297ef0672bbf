/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use criterion::{criterion_group, criterion_main, Criterion};

use netchannels::channel::{Channel, ChannelMode, ChannelSettings};

fn bench_channel(c: &mut Criterion) {
    c.bench_function("pooled_acquire_release", |b| {
        let channel: Channel<Vec<u8>> = Channel::new(
            "bench-pool",
            ChannelSettings {
                capacity: 1024,
                mode: ChannelMode::Pooled,
            },
        );
        let injector = channel.injector();
        for _ in 0..1024 {
            injector.send(vec![0u8; 256], None).unwrap();
        }
        b.iter(|| {
            let loan = channel.acquire(None, None).unwrap();
            channel.release(loan).unwrap();
        });
    });

    c.bench_function("stream_inject_acquire_release", |b| {
        let channel: Channel<u64> = Channel::new(
            "bench-stream",
            ChannelSettings {
                capacity: 1024,
                mode: ChannelMode::Stream,
            },
        );
        let injector = channel.injector();
        let mut i = 0u64;
        b.iter(|| {
            injector.send(i, None).unwrap();
            i += 1;
            let loan = channel.acquire(None, None).unwrap();
            channel.release(loan).unwrap();
        });
    });
}

criterion_group!(benches, bench_channel);
criterion_main!(benches);
