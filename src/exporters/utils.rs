//! # utils
//!
//! The utils module provides common functions used by the exporters.
use clap::crate_version;
use std::env::consts::{ARCH, OS};
use std::error::Error;
use sysinfo::{System, SystemExt};

/// Returns a name filtered from potential characters that
/// could break exporters output.
///
/// Here we replace:
/// 1. Double quote by backslash double quote.
/// 2. Remove carriage return.
pub fn filter_name(name: &str) -> String {
    name.replace('\"', "\\\"").replace('\n', "")
}

/// Returns a human friendly name from a bundle identifier:
/// the `com.` prefix is dropped, every word separated by a dot or an
/// underscore is capitalized.
pub fn translate_app_name(name: &str) -> String {
    let name = name.strip_prefix("com.").unwrap_or(name);
    name.split(['_', '.'])
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Returns power-observer version.
pub fn get_version() -> String {
    String::from(crate_version!())
}

/// Returns the hostname of the system running power-observer.
pub fn get_hostname() -> Result<String, Box<dyn Error>> {
    let hostname = hostname::get()?;
    match hostname.to_str() {
        Some(name) => Ok(String::from(name)),
        None => Err(format!("hostname {hostname:?} isn't valid UTF-8").into()),
    }
}

/// Describes the operating system and architecture, e.g. `macOS 14.2 Sonoma (aarch64)`.
pub fn get_platform() -> String {
    let system = System::new();
    let os = system
        .long_os_version()
        .unwrap_or_else(|| String::from(OS));
    format!("{os} ({ARCH})")
}


#[test]
fn test_filter_name_with_carriage_return() {
    let name = "bash-csleep infinity;\n> echo \"plop\"";
    assert_eq!(
        filter_name(name),
        String::from("bash-csleep infinity;> echo \\\"plop\\\"")
    );
}

//  Copyright 2024 The power-observer authors.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
