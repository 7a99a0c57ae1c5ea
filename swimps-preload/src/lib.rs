//! The sampling agent that runs inside the profiled process.
//!
//! The controller injects this shared object through `LD_PRELOAD`. Its
//! lifecycle brackets the target's `main`: the constructor below runs before
//! it and starts the sampling timer, the destructor runs after it and shuts
//! sampling down cleanly. In between, the only code of ours that executes is
//! the signal handler in [`sampler`].

mod agent;
mod sampler;

// Run as early as possible by pretending to be a global constructor, and as
// late as possible on the way out. The linker collects these sections into
// the code glibc runs around main.
#[used]
#[link_section = ".init_array"]
static PRELOAD_CONSTRUCTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn swimps_preload_constructor() {
        agent::initialise();
    }
    swimps_preload_constructor
};

#[used]
#[link_section = ".fini_array"]
static PRELOAD_DESTRUCTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn swimps_preload_destructor() {
        agent::teardown();
    }
    swimps_preload_destructor
};
