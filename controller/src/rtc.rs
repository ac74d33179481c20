//! External RTC over the serial header. The host has no battery-backed
//! clock; at the end of each cycle the RTC is read for drift logging
//! and rewritten from the (NTP-corrected) system clock.

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use anyhow::Context;
use chrono::{Local, NaiveDateTime};

use crate::eventlog::EventLog;

const RTC_PORT: &str = "/dev/serial0";
const RTC_BAUD: u32 = 115_200;
const RTC_TIMEOUT: Duration = Duration::from_secs(1);

const REPLY_PREFIX: &str = "REPLY_RTC";
const SET_ECHO_PREFIX: &str = "SET_RTC";

pub trait ClockSync {
    fn sync(&self) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Clone)]
pub struct RtcLink {
    events: EventLog,
}

impl RtcLink {
    pub fn new(events: EventLog) -> Self {
        Self { events }
    }
}

impl ClockSync for RtcLink {
    /// Serial I/O is blocking, so the whole exchange runs on the
    /// blocking pool.
    async fn sync(&self) -> anyhow::Result<()> {
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || sync_blocking(&events))
            .await
            .context("rtc sync task panicked")?
    }
}

fn sync_blocking(events: &EventLog) -> anyhow::Result<()> {
    let port = serialport::new(RTC_PORT, RTC_BAUD)
        .timeout(RTC_TIMEOUT)
        .open()
        .with_context(|| format!("failed to open rtc port {RTC_PORT}"))?;
    let mut reader = BufReader::new(port);

    reader.get_mut().write_all(b"GET_RTC \r\n")?;
    let mut reply = String::new();
    reader.read_line(&mut reply)?;
    match parse_rtc_reply(&reply) {
        Some(rtc_time) => {
            events.info("D03", &format!("rtc reports {rtc_time}"));
        }
        None => {
            events.error("D04", &format!("unexpected rtc reply: {}", reply.trim()));
        }
    }

    let now = Local::now();
    let command = format!("SET_RTC {}\r\n", now.format("%Y/%m/%d %H:%M:%S"));
    reader.get_mut().write_all(command.as_bytes())?;

    let mut echo = String::new();
    reader.read_line(&mut echo)?;
    if is_set_acknowledged(&echo) {
        events.info("D05", "rtc updated from system clock");
        Ok(())
    } else {
        events.error("D04", &format!("rtc set not acknowledged: {}", echo.trim()));
        anyhow::bail!("rtc set not acknowledged")
    }
}

/// `REPLY_RTC 2026/08/28 06:15:02` lines from the RTC firmware.
fn parse_rtc_reply(line: &str) -> Option<NaiveDateTime> {
    let rest = line.trim().strip_prefix(REPLY_PREFIX)?.trim();
    NaiveDateTime::parse_from_str(rest, "%Y/%m/%d %H:%M:%S").ok()
}

fn is_set_acknowledged(line: &str) -> bool {
    line.trim().starts_with(SET_ECHO_PREFIX)
}
