use crate::device::{DeviceContext, LED_HANDLER, LED_MAIN};
use crate::shared::{self, SharedWord};
use crate::SimResult;
use tickrace_config::{HalfOrder, LedOwnership, SharedRole, SystemConfig};

/// Code bound to an interrupt vector.
pub trait InterruptHandler: std::fmt::Debug {
    fn service(&mut self, ctx: &mut DeviceContext) -> SimResult<()>;

    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Enter `handler` the way the hardware does: GIE cleared on entry and
/// restored on return, so the main loop can never run in between.
pub fn service_masked<H: InterruptHandler + ?Sized>(
    handler: &mut H,
    ctx: &mut DeviceContext,
) -> SimResult<()> {
    let token = ctx.irq.acquire();
    let result = handler.service(ctx);
    ctx.irq.release(token);
    result
}

/// TIMER3_A0 handler: keeps time, blinks the handler LED and publishes the
/// shared word.
#[derive(Debug, Clone)]
pub struct TimerHandler {
    ticks: u16,
    toggle_every: u16,
    ownership: LedOwnership,
    role: SharedRole,
    write_order: HalfOrder,
    services: u64,
}

impl TimerHandler {
    pub fn new(config: &SystemConfig) -> Self {
        Self {
            ticks: 0,
            toggle_every: config.toggle_every,
            ownership: config.leds.ownership,
            role: config.shared.role,
            write_order: config.shared.write_order,
            services: 0,
        }
    }

    /// Current tick count, always below `toggle_every`.
    pub fn tick_counter(&self) -> u16 {
        self.ticks
    }

    pub fn services(&self) -> u64 {
        self.services
    }
}

impl InterruptHandler for TimerHandler {
    fn service(&mut self, ctx: &mut DeviceContext) -> SimResult<()> {
        // next interrupt in one period
        ctx.rearm()?;
        self.services += 1;

        self.ticks += 1;
        if self.ticks >= self.toggle_every {
            self.ticks = 0;
            ctx.toggle(LED_HANDLER)?;
            if self.ownership == LedOwnership::HandlerOwnsBoth {
                ctx.toggle(LED_MAIN)?;
            }
            tracing::debug!("Handler LED toggled after {} firings", self.services);
        }

        if self.role != SharedRole::Off {
            for half in shared::halves(self.write_order) {
                shared::store(&mut ctx.bus, half, SharedWord::PUBLISHED.half(half))?;
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "tick_counter": self.ticks,
            "services": self.services,
        })
    }
}
