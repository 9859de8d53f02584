//! Zero-key aggregation: one partial set per worker, merged in worker order.

use crate::error::Result;
use crate::executor::context::ExecContext;

use super::accum::AccSet;
use super::{try_for_each_row, Grouped, Input};

pub(super) fn aggregate(ctx: &ExecContext<'_>, input: &Input<'_>) -> Result<Grouped> {
    let workers = ctx.workers_for(input.nrows);
    let partials = ctx.pool.map_ranges(input.nrows, workers, |_, start, end| -> Result<AccSet> {
        let mut set = AccSet::new(ctx.arena, &input.plans, 1)?;
        try_for_each_row(input.selection, start, end, |row| {
            set.add_row(0);
            for (j, agg) in input.aggs.iter().enumerate() {
                let (word, null) = agg.word(row);
                set.update(0, j, word, null);
            }
            Ok(())
        })?;
        Ok(set)
    });
    let mut partials = partials.into_iter();
    let mut total = match partials.next() {
        Some(first) => first?,
        None => AccSet::new(ctx.arena, &input.plans, 1)?,
    };
    for partial in partials {
        total.merge_group(0, &partial?, 0);
    }
    Ok(Grouped {
        keys: Vec::new(),
        aggs: total.finish(&input.plans, &[0])?,
    })
}
