use mlua::Function;

pub(crate) struct Timer {
    pub id: u32,
    pub delay: f64,
    pub callback: Function,
    pub active: bool,
    pub run_once: bool,
    /// `run_delayed` timers disappear after firing; handle timers only stop.
    pub detached: bool,
    pub next_fire: f64,
}

#[derive(Default)]
pub(crate) struct TimerList {
    next_id: u32,
    timers: Vec<Timer>,
}

impl TimerList {
    pub fn create(&mut self, delay: f64, callback: Function) -> u32 {
        self.next_id += 1;
        self.timers.push(Timer {
            id: self.next_id,
            delay,
            callback,
            active: false,
            run_once: false,
            detached: false,
            next_fire: 0.0,
        });
        self.next_id
    }

    pub fn run_delayed(&mut self, delay: f64, callback: Function, now: f64) -> u32 {
        let id = self.create(delay, callback);
        if let Some(timer) = self.get_mut(id) {
            timer.active = true;
            timer.run_once = true;
            timer.detached = true;
            timer.next_fire = now + delay;
        }
        id
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Timer> {
        self.timers.iter_mut().find(|t| t.id == id)
    }

    pub fn start(&mut self, id: u32, now: f64) -> bool {
        let Some(timer) = self.get_mut(id) else {
            return false;
        };
        timer.active = true;
        timer.next_fire = now + timer.delay;
        true
    }

    pub fn stop(&mut self, id: u32) -> bool {
        let Some(timer) = self.get_mut(id) else {
            return false;
        };
        timer.active = false;
        true
    }

    pub fn is_active(&self, id: u32) -> bool {
        self.timers.iter().any(|t| t.id == id && t.active)
    }

    /// Collects callbacks due at `now`, rearming repeating timers.
    pub fn take_due(&mut self, now: f64) -> Vec<(u32, Function)> {
        let mut due = Vec::new();
        for timer in self.timers.iter_mut().filter(|t| t.active && now >= t.next_fire) {
            due.push((timer.id, timer.callback.clone()));
            if timer.run_once {
                timer.active = false;
            } else {
                timer.next_fire = now + timer.delay;
            }
        }
        self.timers.retain(|t| !(t.detached && !t.active));
        due
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Lua;

    fn noop(lua: &Lua) -> Function {
        lua.create_function(|_, ()| Ok(())).expect("function")
    }

    #[test]
    fn repeating_timer_rearms_and_stops() {
        let lua = Lua::new();
        let mut timers = TimerList::default();
        let id = timers.create(0.5, noop(&lua));
        assert!(timers.take_due(10.0).is_empty(), "new timers start inactive");
        assert!(timers.start(id, 10.0));
        assert!(timers.take_due(10.2).is_empty());
        assert_eq!(timers.take_due(10.5).len(), 1);
        assert_eq!(timers.take_due(11.0).len(), 1);
        timers.stop(id);
        assert!(timers.take_due(20.0).is_empty());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn delayed_calls_fire_once_and_vanish() {
        let lua = Lua::new();
        let mut timers = TimerList::default();
        timers.run_delayed(1.0, noop(&lua), 0.0);
        assert!(timers.take_due(0.5).is_empty());
        assert_eq!(timers.take_due(1.0).len(), 1);
        assert_eq!(timers.len(), 0);
        assert!(timers.take_due(5.0).is_empty());
    }
}
