// Plain-text snapshot of the network, written once the engine has stopped.

use std::io::{self, Write};

use crate::sim_context::SimContext;

const STATE_INDENT: usize = 3;

pub fn write_network(ctx: &SimContext, out: &mut dyn Write) -> io::Result<()> {
    let nodes = ctx.node_snapshot();
    let links = ctx.link_snapshot();

    writeln!(out, "Simulation state:")?;
    writeln!(out, "==================== Network description ====================")?;
    writeln!(out, "Nodes:")?;
    for handle in &nodes {
        writeln!(out, "-> {}: {}", handle.id(), handle.lock().description())?;
    }
    writeln!(out, "-------------------------------------------------------------")?;
    writeln!(out, "Links:")?;
    for link in &links {
        let link = link.lock();
        writeln!(out, "-> {}: {}", link.id(), link.description())?;
    }
    writeln!(out, "==================== Network state ==========================")?;
    for handle in &nodes {
        writeln!(out, "Node {}:", handle.id())?;
        writeln!(out, "{}", handle.lock().state_report(STATE_INDENT))?;
    }
    Ok(())
}
