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

pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod flow;
pub mod logger;
pub mod net;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod stats;

pub use channel::{Channel, ChannelMode, ChannelSettings, Injector, Loan, TxOptions};
pub use config::NetConfig;
pub use error::{Error, Result};
pub use executor::{Recovery, TaskChannel, TaskContext, TaskExecutor};
pub use packet::Packet;
pub use session::Net;
