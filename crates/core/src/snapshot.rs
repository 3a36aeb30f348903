use crate::{InterruptHandler, Machine, SharedWord};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize, Debug)]
pub struct MachineSnapshot {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub steps: u64,
    pub clocks: u64,
    pub firings: u64,
    pub services: u64,
    pub gie: bool,
    pub irq_pending: bool,
    pub threshold: u16,
    pub shared: SharedWord,
    pub leds: LedSnapshot,
    pub main_loop: MainLoopSnapshot,
    pub handler: serde_json::Value,
    pub peripherals: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Debug)]
pub struct LedSnapshot {
    pub handler: bool,
    pub main: bool,
    pub diagnostic: bool,
}

#[derive(Serialize, Debug)]
pub struct MainLoopSnapshot {
    pub pc: usize,
    pub program: Vec<String>,
    pub iterations: u64,
    pub races: u64,
    pub in_critical_section: bool,
    pub local_copy: SharedWord,
}

impl MachineSnapshot {
    pub fn capture<H: InterruptHandler>(machine: &Machine<H>) -> Self {
        use crate::device::{LED_DIAGNOSTIC, LED_HANDLER, LED_MAIN};

        let ctx = &machine.ctx;
        let level = |pin| ctx.level(pin).unwrap_or(false);
        Self {
            kind: "tickrace_machine",
            steps: machine.steps(),
            clocks: machine.clocks(),
            firings: machine.firings(),
            services: machine.services(),
            gie: ctx.irq.is_enabled(),
            irq_pending: machine.is_pending(),
            threshold: ctx.threshold(),
            shared: ctx.shared().unwrap_or(SharedWord::RESET),
            leds: LedSnapshot {
                handler: level(LED_HANDLER),
                main: level(LED_MAIN),
                diagnostic: level(LED_DIAGNOSTIC),
            },
            main_loop: MainLoopSnapshot {
                pc: machine.main.pc(),
                program: machine.main.program().iter().map(|op| op.to_string()).collect(),
                iterations: machine.main.iterations(),
                races: machine.main.races(),
                in_critical_section: machine.main.in_critical_section(),
                local_copy: machine.main.local_copy(),
            },
            handler: machine.handler.snapshot(),
            peripherals: ctx.bus.snapshot(),
        }
    }
}
